//! # kvraft-storage
//!
//! why: provide durable persistence for raft state and the replicated key-value data
//! relations: persists kvraft-core's log and hard state, applied to by the kvraft-node worker
//! what: RaftStorage trait (file + in-memory), crc-framed wal, mvcc KvEngine

pub mod engine;
pub mod error;
pub mod raft_log;
pub mod wal;

pub use engine::{EngineOptions, KeyValue, KvEngine, SnapshotMeta};
pub use error::{Result, StorageError};
pub use raft_log::{FileStorage, InMemoryStorage, PersistedLog, RaftStorage};
pub use wal::{FsyncPolicy, SyncHandle, Wal};
