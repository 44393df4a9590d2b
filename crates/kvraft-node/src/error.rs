//! # error
//!
//! why: separate what a client may see from what stops the node
//! relations: KvError crosses the client wire (server.rs, client.rs); NodeError ends node.rs and main.rs
//! what: KvError client taxonomy, NodeError fatal taxonomy with process exit codes

use kvraft_core::NodeId;
use kvraft_storage::StorageError;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// The only failures a client call can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KvError {
    /// Retry against `leader_addr` when it is known.
    #[error("not the leader (leader: {leader_id:?}, client address: {leader_addr:?})")]
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("key not found")]
    NotFound,
}

/// Failures that stop the node
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
    #[error("task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(err: tokio::task::JoinError) -> Self {
        NodeError::Join(err.to_string())
    }
}

impl NodeError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            NodeError::Config(_) => 2,
            NodeError::Storage(_) | NodeError::Inconsistent(_) => 3,
            NodeError::Io(_) | NodeError::Join(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let config = NodeError::from(ConfigError::Invalid("x".into()));
        assert_eq!(config.exit_code(), 2);
        let storage = NodeError::from(StorageError::OutOfOrderApply { expected: 1, got: 2 });
        assert_eq!(storage.exit_code(), 3);
        assert_eq!(NodeError::Inconsistent("x".into()).exit_code(), 3);
        assert_eq!(NodeError::Join("x".into()).exit_code(), 1);
    }

    #[test]
    fn kv_error_crosses_the_wire() {
        let err = KvError::NotLeader {
            leader_id: Some(2),
            leader_addr: Some("127.0.0.1:3013".into()),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<KvError>(&json).unwrap(), err);
    }
}
