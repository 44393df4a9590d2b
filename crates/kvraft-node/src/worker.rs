//! # worker
//!
//! why: raft state must change in one place, in one order, with storage written before anything leaves the node
//! relations: owns RaftNode + RaftStorage; fed by the service, the timer and the peer transport; writes the KvEngine
//! what: Request/Event types and the Worker event loop
//!
//! Every event ends in `flush`, which runs the same pipeline:
//! persist, reset timer, send, ship snapshots, apply, answer, compact.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvraft_core::{
    Command, Envelope, HardState, NodeId, RaftError, RaftNode, SnapshotInstall, StepOutput,
};
use kvraft_storage::{KvEngine, RaftStorage};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{KvError, NodeError};
use crate::service::NodeStatus;
use crate::transport::{Directory, Transport};

/// What the client service asks of the worker
#[derive(Debug)]
pub enum Request {
    /// Replicate a write; answered with its revision once applied
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<u64, KvError>>,
    },
    /// Confirm leadership; answered with an index the engine has reached
    ReadIndex {
        reply: oneshot::Sender<Result<u64, KvError>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub enum Event {
    Client(Request),
    ElectionTimeout,
    Heartbeat,
}

/// Channel ends the worker consumes
pub struct WorkerChannels {
    pub events: mpsc::Receiver<Event>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub timer_reset: Arc<Notify>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
struct PendingWrite {
    term: u64,
    reply: oneshot::Sender<Result<u64, KvError>>,
}

pub struct Worker {
    raft: RaftNode,
    storage: Box<dyn RaftStorage>,
    engine: Arc<RwLock<KvEngine>>,
    transport: Arc<dyn Transport>,
    directory: Directory,
    channels: WorkerChannels,
    persisted: HardState,
    pending_writes: BTreeMap<u64, PendingWrite>,
    pending_reads: HashMap<u64, oneshot::Sender<Result<u64, KvError>>>,
    next_read_id: u64,
    snapshots_sent: HashMap<NodeId, Instant>,
    snapshot_threshold: u64,
    snapshot_resend: Duration,
}

impl Worker {
    /// `raft` must already be restored from `storage` and `engine`.
    pub fn new(
        raft: RaftNode,
        storage: Box<dyn RaftStorage>,
        engine: Arc<RwLock<KvEngine>>,
        transport: Arc<dyn Transport>,
        directory: Directory,
        channels: WorkerChannels,
        snapshot_threshold: u64,
    ) -> Self {
        let persisted = raft.hard_state();
        let snapshot_resend = Duration::from_millis(raft.config.election_timeout_max);
        Self {
            raft,
            storage,
            engine,
            transport,
            directory,
            channels,
            persisted,
            pending_writes: BTreeMap::new(),
            pending_reads: HashMap::new(),
            next_read_id: 1,
            snapshots_sent: HashMap::new(),
            snapshot_threshold,
            snapshot_resend,
        }
    }

    /// Process events until shutdown or a storage failure.
    ///
    /// Whatever is still pending when the loop ends is answered with `Timeout`.
    pub async fn run(mut self) -> Result<(), NodeError> {
        info!(
            node = self.raft.id,
            term = self.raft.current_term,
            last_index = self.raft.last_log_index(),
            applied = self.raft.last_applied,
            "worker started"
        );
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!(node = self.raft.id, error = %e, "worker stopped on a fatal error");
        }
        self.fail_pending();
        if result.is_ok() {
            self.storage.sync()?;
            self.engine.write().sync()?;
            info!(node = self.raft.id, "worker stopped");
        }
        result
    }

    async fn event_loop(&mut self) -> Result<(), NodeError> {
        if *self.channels.shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = self.channels.shutdown.changed() => return Ok(()),
                event = self.channels.events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => return Ok(()),
                },
                Some(envelope) = self.channels.inbound.recv() => self.handle_envelope(envelope)?,
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<(), NodeError> {
        match event {
            Event::ElectionTimeout => {
                if self.raft.is_leader() {
                    self.raft.check_quorum();
                    self.flush(StepOutput::default())
                } else {
                    info!(node = self.raft.id, term = self.raft.current_term + 1, "election timeout, campaigning");
                    let out = self.raft.campaign();
                    self.flush(out)
                }
            }
            Event::Heartbeat => {
                if self.raft.is_leader() {
                    let out = self.raft.broadcast_append_entries();
                    self.flush(out)
                } else {
                    Ok(())
                }
            }
            Event::Client(request) => self.handle_request(request),
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<(), NodeError> {
        match request {
            Request::Propose { command, reply } => match self.raft.append_entry(command) {
                Ok(entry) => {
                    debug!(node = self.raft.id, index = entry.index, "proposed");
                    self.pending_writes.insert(
                        entry.index,
                        PendingWrite {
                            term: entry.term,
                            reply,
                        },
                    );
                    let out = self.raft.broadcast_append_entries();
                    self.flush(out)
                }
                Err(RaftError::NotLeader { leader_id }) => {
                    let _ = reply.send(Err(self.not_leader(leader_id)));
                    Ok(())
                }
            },
            Request::ReadIndex { reply } => {
                let id = self.next_read_id;
                self.next_read_id += 1;
                match self.raft.request_read(id) {
                    Ok(out) => {
                        self.pending_reads.insert(id, reply);
                        self.flush(out)
                    }
                    Err(RaftError::NotLeader { leader_id }) => {
                        let _ = reply.send(Err(self.not_leader(leader_id)));
                        Ok(())
                    }
                }
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Request::Campaign { reply } => {
                info!(node = self.raft.id, "campaign requested");
                let out = self.raft.campaign();
                self.flush(out)?;
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), NodeError> {
        if envelope.to != self.raft.id {
            warn!(node = self.raft.id, to = envelope.to, "envelope for another node dropped");
            return Ok(());
        }
        debug!(
            node = self.raft.id,
            from = envelope.from,
            kind = envelope.message.kind(),
            term = envelope.message.term(),
            "message received"
        );
        let mut out = self.raft.step(envelope.from, envelope.message);
        if let Some(install) = out.install.take() {
            self.install_snapshot(install)?;
        }
        self.flush(out)
    }

    /// Engine first: a crash after this leaves the engine ahead of the log,
    /// which startup reconciles.
    fn install_snapshot(&mut self, install: SnapshotInstall) -> Result<(), NodeError> {
        let meta = self.engine.write().restore(&install.data)?;
        if meta.applied_index != install.last_included_index {
            return Err(NodeError::Inconsistent(format!(
                "snapshot for index {} restored the engine to index {}",
                install.last_included_index, meta.applied_index
            )));
        }
        info!(
            node = self.raft.id,
            index = install.last_included_index,
            term = install.last_included_term,
            revision = meta.revision,
            "snapshot installed"
        );
        // outcome of writes the snapshot swallowed is unknown here
        let covered: Vec<u64> = self
            .pending_writes
            .range(..=install.last_included_index)
            .map(|(&index, _)| index)
            .collect();
        for index in covered {
            if let Some(pending) = self.pending_writes.remove(&index) {
                let _ = pending.reply.send(Err(KvError::Timeout));
            }
        }
        Ok(())
    }

    fn flush(&mut self, out: StepOutput) -> Result<(), NodeError> {
        self.persist()?;
        if out.reset_election_timer {
            self.channels.timer_reset.notify_one();
        }
        for envelope in out.messages {
            self.send(envelope);
        }
        for peer in out.snapshot_targets {
            self.ship_snapshot(peer)?;
        }
        self.apply_committed()?;
        self.answer_reads();
        self.maybe_compact()
    }

    fn persist(&mut self) -> Result<(), NodeError> {
        let hard_state = self.raft.hard_state();
        if hard_state != self.persisted {
            self.storage.save_hard_state(&hard_state)?;
            self.persisted = hard_state;
        }
        let changes = self.raft.log.take_changes();
        if !changes.is_empty() {
            self.storage.persist(&changes)?;
        }
        Ok(())
    }

    fn send(&self, envelope: Envelope) {
        let (to, kind) = (envelope.to, envelope.message.kind());
        if let Err(e) = self.transport.send(envelope) {
            debug!(node = self.raft.id, to, kind, error = %e, "send failed");
        }
    }

    fn ship_snapshot(&mut self, peer: NodeId) -> Result<(), NodeError> {
        if let Some(sent) = self.snapshots_sent.get(&peer) {
            if sent.elapsed() < self.snapshot_resend {
                return Ok(());
            }
        }
        let (index, term, data) = {
            let engine = self.engine.read();
            (engine.applied_index(), engine.applied_term(), engine.export()?)
        };
        if let Some(message) = self.raft.install_snapshot_message(index, term, data) {
            info!(node = self.raft.id, peer, index, term, "sending snapshot");
            self.snapshots_sent.insert(peer, Instant::now());
            self.send(Envelope::new(self.raft.id, peer, message));
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), NodeError> {
        let entries = self.raft.get_entries_to_apply();
        if entries.is_empty() {
            return Ok(());
        }
        let mut answered = Vec::new();
        let sync = {
            let mut engine = self.engine.write();
            for entry in &entries {
                let revision = engine.apply(entry)?;
                if let Some(pending) = self.pending_writes.remove(&entry.index) {
                    answered.push((pending, entry.term, revision));
                }
            }
            engine.sync_handle()?
        };
        // readers may use the engine while the wal reaches disk
        if let Some(sync) = sync {
            sync.sync()?;
        }
        for (pending, term, revision) in answered {
            // another leader's entry took this index
            let result = if pending.term == term {
                Ok(revision)
            } else {
                Err(self.not_leader(self.raft.leader_id))
            };
            let _ = pending.reply.send(result);
        }
        debug!(node = self.raft.id, applied = self.raft.last_applied, count = entries.len(), "applied");
        Ok(())
    }

    fn answer_reads(&mut self) {
        for ready in self.raft.take_ready_reads() {
            if let Some(reply) = self.pending_reads.remove(&ready.id) {
                let _ = reply.send(Ok(ready.index));
            }
        }
        for id in self.raft.take_aborted_reads() {
            if let Some(reply) = self.pending_reads.remove(&id) {
                let _ = reply.send(Err(self.not_leader(self.raft.leader_id)));
            }
        }
    }

    /// Fold applied entries into an engine snapshot once enough have piled up
    fn maybe_compact(&mut self) -> Result<(), NodeError> {
        if self.snapshot_threshold == 0 {
            return Ok(());
        }
        let behind = self
            .raft
            .last_applied
            .saturating_sub(self.raft.log.snapshot_index());
        if behind < self.snapshot_threshold {
            return Ok(());
        }
        let meta = self.engine.write().snapshot()?;
        if self.raft.compact_log(meta.applied_index) {
            let changes = self.raft.log.take_changes();
            self.storage.persist(&changes)?;
            info!(
                node = self.raft.id,
                index = meta.applied_index,
                revision = meta.revision,
                "log compacted"
            );
        }
        Ok(())
    }

    fn not_leader(&self, leader_id: Option<NodeId>) -> KvError {
        KvError::NotLeader {
            leader_id,
            leader_addr: leader_id.and_then(|id| self.directory.client_addr(id)),
        }
    }

    fn status(&self) -> NodeStatus {
        let engine = self.engine.read();
        NodeStatus {
            id: self.raft.id,
            role: self.raft.state,
            term: self.raft.current_term,
            leader_id: self.raft.leader_id,
            commit_index: self.raft.commit_index,
            last_applied: self.raft.last_applied,
            revision: engine.revision(),
            snapshot_index: self.raft.log.snapshot_index(),
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending_writes) {
            let _ = pending.reply.send(Err(KvError::Timeout));
        }
        for (_, reply) in self.pending_reads.drain() {
            let _ = reply.send(Err(KvError::Timeout));
        }
        // requests still queued behind the shutdown
        self.channels.events.close();
        while let Ok(event) = self.channels.events.try_recv() {
            if let Event::Client(request) = event {
                match request {
                    Request::Propose { reply, .. } | Request::ReadIndex { reply } => {
                        let _ = reply.send(Err(KvError::Timeout));
                    }
                    Request::Status { .. } | Request::Campaign { .. } => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use kvraft_core::{NodeState, RaftConfig};
    use kvraft_storage::{EngineOptions, InMemoryStorage};

    struct Harness {
        events: mpsc::Sender<Event>,
        shutdown: watch::Sender<bool>,
        engine: Arc<RwLock<KvEngine>>,
        task: tokio::task::JoinHandle<Result<(), NodeError>>,
    }

    fn single_node(snapshot_threshold: u64) -> Harness {
        single_node_with(KvEngine::in_memory(), snapshot_threshold)
    }

    fn single_node_with(engine: KvEngine, snapshot_threshold: u64) -> Harness {
        let network = LocalNetwork::new();
        let (transport, inbound) = network.register(1);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::new(RwLock::new(engine));
        let raft = RaftNode::with_config(1, vec![1], RaftConfig::default());
        let worker = Worker::new(
            raft,
            Box::new(InMemoryStorage::new()),
            engine.clone(),
            Arc::new(transport),
            Directory::default(),
            WorkerChannels {
                events: events_rx,
                inbound,
                timer_reset: Arc::new(Notify::new()),
                shutdown: shutdown_rx,
            },
            snapshot_threshold,
        );
        Harness {
            events: events_tx,
            shutdown: shutdown_tx,
            engine,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn ask<T>(
        events: &mpsc::Sender<Event>,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        events.send(Event::Client(make(tx))).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn single_node_writes_and_reads() {
        let h = single_node(0);
        ask(&h.events, |reply| Request::Campaign { reply }).await;

        let status = ask(&h.events, |reply| Request::Status { reply }).await;
        assert_eq!(status.role, NodeState::Leader);
        assert_eq!(status.term, 1);

        let rev = ask(&h.events, |reply| Request::Propose {
            command: Command::put("foo", "bar1"),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(rev, 1);

        let index = ask(&h.events, |reply| Request::ReadIndex { reply })
            .await
            .unwrap();
        assert!(h.engine.read().applied_index() >= index);
        assert_eq!(h.engine.read().get(b"foo", None).unwrap().unwrap().value, b"bar1");

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follower_rejects_writes_and_reads() {
        let h = single_node(0);
        let err = ask(&h.events, |reply| Request::Propose {
            command: Command::put("foo", "bar"),
            reply,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KvError::NotLeader { leader_id: None, .. }));

        let err = ask(&h.events, |reply| Request::ReadIndex { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotLeader { .. }));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn compaction_follows_the_threshold() {
        let h = single_node(3);
        ask(&h.events, |reply| Request::Campaign { reply }).await;
        for i in 0..5 {
            ask(&h.events, |reply| Request::Propose {
                command: Command::put(format!("k{i}"), "v"),
                reply,
            })
            .await
            .unwrap();
        }
        let status = ask(&h.events, |reply| Request::Status { reply }).await;
        assert!(status.snapshot_index >= 3);
        assert_eq!(status.revision, 5);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn applied_writes_reach_the_engine_wal_before_the_reply() {
        let dir = tempfile::tempdir().unwrap();
        let engine = KvEngine::open(dir.path(), EngineOptions::default()).unwrap();
        let h = single_node_with(engine, 0);
        ask(&h.events, |reply| Request::Campaign { reply }).await;

        let rev = ask(&h.events, |reply| Request::Propose {
            command: Command::put("foo", "bar1"),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(rev, 1);

        // the worker still holds its engine; a second one sees what the first wrote
        let reopened = KvEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(reopened.get(b"foo", None).unwrap().unwrap().value, b"bar1");
        assert!(h.engine.try_read().is_some());

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }
}
