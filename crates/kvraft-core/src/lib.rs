//! # kvraft-core
//!
//! why: implement raft consensus for the replicated key-value store in pure rust
//! relations: persisted through kvraft-storage, driven by the kvraft-node runtime
//! what: replicated log, peer messages, election/replication/read-index state machine

pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub use error::RaftError;
pub use log::{Command, LogChanges, LogEntry, RaftLog};
pub use message::{Envelope, RaftMessage};
pub use node::{
    HardState, NodeState, RaftConfig, RaftNode, ReadReady, SnapshotInstall, StepOutput,
};

/// Identifier of a cluster member
pub type NodeId = u64;
