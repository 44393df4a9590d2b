//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management
//! what: NodeState, RaftConfig, RaftNode with elections, replication, catch-up and read-index
//!
//! The node performs no i/o. A host feeds it messages and timer events,
//! persists `hard_state()` and `log.take_changes()`, then delivers the
//! envelopes in the returned `StepOutput`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RaftError;
use crate::log::{Command, LogEntry, RaftLog};
use crate::message::{Envelope, RaftMessage};
use crate::NodeId;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Timing and batching knobs. Times are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// upper bound on entries carried by one AppendEntries
    pub max_entries_per_message: usize,
    /// followers further behind than this get a snapshot instead of a replay
    pub snapshot_catch_up_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_message: 64,
            snapshot_catch_up_threshold: 1024,
        }
    }
}

/// Term and vote; must be on stable storage before any reply leaves the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Snapshot data a follower must load into its state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInstall {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

/// A linearizable read whose leadership check passed; serve it once `index` is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReady {
    pub id: u64,
    pub index: u64,
}

/// Work the host must carry out after driving the node
#[derive(Debug, Default)]
pub struct StepOutput {
    pub messages: Vec<Envelope>,
    /// peers that need an InstallSnapshot built from the state machine
    pub snapshot_targets: Vec<NodeId>,
    pub install: Option<SnapshotInstall>,
    pub reset_election_timer: bool,
}

impl StepOutput {
    fn send(&mut self, from: NodeId, to: NodeId, message: RaftMessage) {
        self.messages.push(Envelope::new(from, to, message));
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    id: u64,
    required_seq: u64,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Latest term this node has seen
    pub current_term: u64,
    /// Node that received our vote in the current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Every member, this node included
    pub cluster_nodes: Vec<NodeId>,
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, u64>,
    pub leader_id: Option<NodeId>,
    pub config: RaftConfig,
    heartbeat_seq: u64,
    acked_seq: HashMap<NodeId, u64>,
    recent_active: HashSet<NodeId>,
    pending_reads: Vec<PendingRead>,
    aborted_reads: Vec<u64>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self::restore(id, cluster_nodes, config, HardState::default(), RaftLog::new(), 0)
    }

    /// Rebuild a node after a restart.
    ///
    /// `applied` is the last index the state machine already holds; it is
    /// committed by definition.
    pub fn restore(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        hard_state: HardState,
        log: RaftLog,
        applied: u64,
    ) -> Self {
        let applied = applied.max(log.snapshot_index());
        Self {
            id,
            state: NodeState::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: applied,
            last_applied: applied,
            cluster_nodes,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            leader_id: None,
            config,
            heartbeat_seq: 0,
            acked_seq: HashMap::new(),
            recent_active: HashSet::new(),
            pending_reads: Vec::new(),
            aborted_reads: Vec::new(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.cluster_nodes
            .iter()
            .copied()
            .filter(|&n| n != self.id)
            .collect()
    }

    /// Strict majority of the cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry(index)
    }

    /// Term at `index`, 0 when the entry is unknown
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- elections --

    /// Become a candidate for the next term and vote for ourselves
    pub fn start_election(&mut self) -> RaftMessage {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        info!(node = self.id, term = self.current_term, "starting election");

        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Start an election and address the vote request to every peer
    pub fn campaign(&mut self) -> StepOutput {
        let request = self.start_election();
        let mut out = StepOutput {
            reset_election_timer: true,
            ..Default::default()
        };
        if self.is_leader() {
            self.replicate_all(&mut out);
        } else {
            for peer in self.peer_ids() {
                out.send(self.id, peer, request.clone());
            }
        }
        out
    }

    /// Returns the response and whether the election timer should reset
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term > self.current_term {
            self.become_follower(term);
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate_id);
        let vote_granted = term == self.current_term
            && can_vote
            && self.log.is_up_to_date(last_log_index, last_log_term);

        if vote_granted {
            self.voted_for = Some(candidate_id);
        }
        debug!(
            node = self.id,
            candidate = candidate_id,
            term,
            vote_granted,
            "vote request"
        );

        let response = RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        };
        (response, vote_granted)
    }

    /// Returns true if this response made us leader
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: NodeId) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term < self.current_term {
            return false;
        }
        if vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Step down, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = ?self.state, "stepping down");
        }
        if self.state == NodeState::Leader {
            self.leader_id = None;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.aborted_reads
            .extend(self.pending_reads.drain(..).map(|r| r.id));
    }

    fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        for peer in self.peer_ids() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        self.acked_seq.clear();
        self.recent_active.clear();
        info!(node = self.id, term = self.current_term, "became leader");

        self.log.append(self.current_term, Command::Noop);
        self.advance_commit_index();
    }

    /// Leader-side check that a quorum was heard from since the last call.
    ///
    /// Returns false when the node had to step down.
    pub fn check_quorum(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let active = 1 + self.recent_active.len();
        self.recent_active.clear();
        if active < self.quorum_size() {
            warn!(node = self.id, term = self.current_term, active, "lost contact with quorum");
            self.become_follower(self.current_term);
            return false;
        }
        true
    }

    // -- replication --

    /// Append a client command to the leader's log
    pub fn append_entry(&mut self, command: Command) -> Result<LogEntry, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            });
        }
        let entry = self.log.append(self.current_term, command);
        self.advance_commit_index();
        Ok(entry)
    }

    fn next_index_for(&self, peer: NodeId) -> u64 {
        self.next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1)
    }

    /// AppendEntries for `peer` starting at its next index.
    ///
    /// `None` when not leader, or when the entries the peer needs were
    /// compacted into the snapshot.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }
        let next = self.next_index_for(peer);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?;
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self
                .log
                .entries_from(next, self.config.max_entries_per_message),
            leader_commit: self.commit_index,
            seq: self.heartbeat_seq,
        })
    }

    /// Whether `peer` should be caught up from a snapshot rather than a log replay
    pub fn needs_snapshot(&self, peer: NodeId) -> bool {
        let next = self.next_index_for(peer);
        if next <= self.log.snapshot_index() {
            return true;
        }
        let behind = self.last_log_index().saturating_sub(next - 1);
        behind > self.config.snapshot_catch_up_threshold && self.last_applied >= next
    }

    pub fn install_snapshot_message(
        &self,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    ) -> Option<RaftMessage> {
        self.is_leader().then(|| RaftMessage::InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_included_index,
            last_included_term,
            data,
        })
    }

    fn replicate_to(&self, peer: NodeId, out: &mut StepOutput) {
        if self.needs_snapshot(peer) {
            out.snapshot_targets.push(peer);
        } else if let Some(message) = self.create_append_entries(peer) {
            out.send(self.id, peer, message);
        }
    }

    fn replicate_all(&mut self, out: &mut StepOutput) {
        if !self.is_leader() {
            return;
        }
        self.heartbeat_seq += 1;
        for peer in self.peer_ids() {
            self.replicate_to(peer, out);
        }
    }

    /// Heartbeat every peer, carrying whatever entries each one is missing
    pub fn broadcast_append_entries(&mut self) -> StepOutput {
        let mut out = StepOutput::default();
        self.replicate_all(&mut out);
        out
    }

    /// Returns the response and whether the election timer should reset
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (self.append_response(false, 0), false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        let mut prev_index = prev_log_index;
        let mut prev_term = prev_log_term;
        let mut entries = entries;
        let snapshot_index = self.log.snapshot_index();
        if prev_index < snapshot_index {
            // the compacted prefix is committed, so it matches the leader
            entries.retain(|e| e.index > snapshot_index);
            prev_index = snapshot_index;
            prev_term = self.log.snapshot_term();
        }

        if prev_index > self.last_log_index() {
            let hint = self.last_log_index();
            return (self.append_response(false, hint), true);
        }
        if !self.log.matches(prev_index, prev_term) {
            let conflict_term = self.log.term_at(prev_index);
            let mut hint = prev_index.saturating_sub(1);
            while hint > self.commit_index && self.log.term_at(hint) == conflict_term {
                hint -= 1;
            }
            debug!(node = self.id, prev_index, hint, "log mismatch");
            return (self.append_response(false, hint), true);
        }

        let last_new = prev_index + entries.len() as u64;
        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    debug!(node = self.id, index = entry.index, "truncating conflicting entries");
                    self.log.truncate_from(entry.index);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(leader_commit.min(last_new));
        }
        (self.append_response(true, last_new), true)
    }

    fn append_response(&self, success: bool, match_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            seq: 0,
        }
    }

    /// Returns true if the commit index advanced
    pub fn handle_append_entries_response(
        &mut self,
        term: u64,
        success: bool,
        from: NodeId,
        match_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term < self.current_term {
            return false;
        }
        self.recent_active.insert(from);

        let known = self.match_index.get(&from).copied().unwrap_or(0);
        if success {
            let matched = known.max(match_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, matched + 1);
            self.advance_commit_index()
        } else {
            let next = self.next_index_for(from);
            let backoff = (next - 1).min(match_index + 1).max(known + 1).max(1);
            self.next_index.insert(from, backoff);
            false
        }
    }

    /// Commit the highest current-term index held by a strict majority
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.last_log_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(t) if t == self.current_term => {}
                // terms only decrease further back
                _ => break,
            }
            let replicas = 1 + self
                .match_index
                .iter()
                .filter(|(peer, &m)| **peer != self.id && m >= n)
                .count();
            if replicas >= quorum {
                debug!(node = self.id, commit = n, "commit advanced");
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // -- snapshots --

    /// Returns the response and whether the host must install the snapshot data
    pub fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            let reject = RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                last_included_index: 0,
            };
            return (reject, false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        let response = RaftMessage::InstallSnapshotResponse {
            term: self.current_term,
            last_included_index,
        };
        if last_included_index <= self.commit_index {
            return (response, false);
        }

        info!(node = self.id, index = last_included_index, "installing snapshot");
        self.log
            .reset_to_snapshot(last_included_index, last_included_term);
        self.commit_index = last_included_index;
        self.last_applied = last_included_index;
        (response, true)
    }

    /// Returns true if the commit index advanced
    pub fn handle_install_snapshot_response(
        &mut self,
        term: u64,
        from: NodeId,
        last_included_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term < self.current_term {
            return false;
        }
        self.recent_active.insert(from);
        if last_included_index == 0 {
            return false;
        }
        let matched = self
            .match_index
            .get(&from)
            .copied()
            .unwrap_or(0)
            .max(last_included_index);
        self.match_index.insert(from, matched);
        self.next_index.insert(from, matched + 1);
        self.advance_commit_index()
    }

    /// Drop applied entries up to `index` once the state machine snapshot covers them
    pub fn compact_log(&mut self, index: u64) -> bool {
        index <= self.last_applied && self.log.compact_to(index)
    }

    // -- reads --

    /// Register a linearizable read and start the heartbeat round that confirms it
    pub fn request_read(&mut self, id: u64) -> Result<StepOutput, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            });
        }
        self.pending_reads.push(PendingRead {
            id,
            required_seq: self.heartbeat_seq + 1,
        });
        Ok(self.broadcast_append_entries())
    }

    fn record_ack(&mut self, from: NodeId, seq: u64) {
        let acked = self.acked_seq.entry(from).or_insert(0);
        *acked = (*acked).max(seq);
    }

    /// Reads confirmed by a quorum, in registration order
    pub fn take_ready_reads(&mut self) -> Vec<ReadReady> {
        if !self.is_leader() || self.log.term_at(self.commit_index) != Some(self.current_term) {
            return Vec::new();
        }
        let quorum = self.quorum_size();
        let acked = |seq: u64| {
            1 + self
                .acked_seq
                .iter()
                .filter(|(peer, &s)| **peer != self.id && s >= seq)
                .count()
        };
        let confirmed = self
            .pending_reads
            .iter()
            .take_while(|r| acked(r.required_seq) >= quorum)
            .count();
        let index = self.commit_index;
        self.pending_reads
            .drain(..confirmed)
            .map(|r| ReadReady { id: r.id, index })
            .collect()
    }

    /// Reads that can no longer be confirmed because leadership was lost
    pub fn take_aborted_reads(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.aborted_reads)
    }

    // -- state machine --

    /// Committed entries not yet applied, in index order
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self.log.slice(self.last_applied + 1, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }

    // -- dispatch --

    /// Handle any message from `from`
    pub fn step(&mut self, from: NodeId, message: RaftMessage) -> StepOutput {
        let mut out = StepOutput::default();
        match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (reply, reset) =
                    self.handle_vote_request(term, candidate_id, last_log_index, last_log_term);
                out.reset_election_timer = reset;
                out.send(self.id, from, reply);
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                if self.handle_vote_response(term, vote_granted, from) {
                    self.replicate_all(&mut out);
                }
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                seq,
            } => {
                let (reply, reset) = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                out.reset_election_timer = reset;
                out.send(self.id, from, reply.with_seq(seq));
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
                seq,
            } => {
                self.handle_append_entries_response(term, success, from, match_index);
                if self.is_leader() && term == self.current_term {
                    self.record_ack(from, seq);
                    if !success || self.next_index_for(from) <= self.last_log_index() {
                        self.replicate_to(from, &mut out);
                    }
                }
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => {
                out.reset_election_timer = term >= self.current_term;
                let (reply, install) = self.handle_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                );
                if install {
                    out.install = Some(SnapshotInstall {
                        last_included_index,
                        last_included_term,
                        data,
                    });
                }
                out.send(self.id, from, reply);
            }
            RaftMessage::InstallSnapshotResponse {
                term,
                last_included_index,
            } => {
                self.handle_install_snapshot_response(term, from, last_included_index);
                if self.is_leader()
                    && term == self.current_term
                    && self.next_index_for(from) <= self.last_log_index()
                {
                    self.replicate_to(from, &mut out);
                }
            }
        }
        out
    }
}
