//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, framed onto the wire by kvraft-node
//! what: vote, append-entries and install-snapshot rpcs plus the addressed Envelope

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::NodeId;

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse { term: u64, vote_granted: bool },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        /// heartbeat round, echoed back to confirm leadership for reads
        seq: u64,
    },
    /// Response to AppendEntries
    ///
    /// On success `match_index` is the follower's last matching index; on
    /// failure it is the index the leader should back off to.
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
        seq: u64,
    },
    /// Replace a lagging follower's state with a state machine image
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
    /// Response to InstallSnapshot; index 0 means the snapshot was refused
    InstallSnapshotResponse { term: u64, last_included_index: u64 },
}

impl RaftMessage {
    /// The sender's term at the time the message was built
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
            RaftMessage::InstallSnapshot { .. } => "install_snapshot",
            RaftMessage::InstallSnapshotResponse { .. } => "install_snapshot_response",
        }
    }

    /// Stamp the heartbeat round onto an AppendEntries reply
    pub fn with_seq(mut self, round: u64) -> Self {
        if let RaftMessage::AppendEntriesResponse { seq, .. } = &mut self {
            *seq = round;
        }
        self
    }
}

/// A message addressed from one member to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }
}
