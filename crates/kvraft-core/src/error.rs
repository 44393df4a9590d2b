//! # error
//!
//! what: the one failure the consensus state machine reports to its host

use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    /// The request needs the leader; `leader_id` is the last leader this node heard from.
    #[error("node is not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },
}
