//! # kvraft-node
//!
//! why: turn the consensus state machine and the storage engine into a networked key-value node
//! relations: drives kvraft-core, persists through kvraft-storage, serves clients over tcp
//! what: config, worker runtime, peer transports, client service/server/client, demo loop

pub mod client;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod node;
pub mod server;
pub mod service;
pub mod timer;
pub mod transport;
pub mod worker;

pub use client::{ClientError, KvClient};
pub use config::{ConfigError, MemberConfig, NodeConfig};
pub use error::{KvError, NodeError};
pub use node::{Network, Node};
pub use server::{ClientReply, ClientRequest};
pub use service::{Consistency, KvService, NodeStatus, ReadOptions};
pub use transport::{LocalNetwork, Transport, TransportError};
