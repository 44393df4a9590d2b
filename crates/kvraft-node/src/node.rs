//! # node
//!
//! why: wire storage, consensus, transport and the client surface into one running member
//! relations: built from NodeConfig; spawns the worker, timer, peer and client tasks
//! what: Node (start / shutdown / run_until_shutdown), Network selection, startup recovery

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kvraft_core::{NodeId, RaftNode};
use kvraft_storage::{FileStorage, KvEngine, RaftStorage};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::error::NodeError;
use crate::server::serve_clients;
use crate::service::KvService;
use crate::timer::{run_timer, TimerSettings};
use crate::transport::{serve_peers, Directory, Hello, LocalNetwork, TcpTransport, Transport};
use crate::worker::{Worker, WorkerChannels};

const EVENT_QUEUE_DEPTH: usize = 1024;

/// How a node reaches its peers
#[derive(Debug, Clone)]
pub enum Network {
    /// Real sockets at the configured peer addresses
    Tcp,
    /// In-process, for tests
    Local(LocalNetwork),
}

/// A running cluster member
pub struct Node {
    id: NodeId,
    service: KvService,
    client_addr: Option<String>,
    peer_addr: Option<String>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<Result<(), NodeError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Recover local state and start every task of the node
    pub async fn start(config: NodeConfig, network: Network) -> Result<Self, NodeError> {
        config.validate()?;
        let id = config.id;
        let data_dir = config.data_dir();
        info!(node = id, data_dir = %data_dir.display(), "starting node");

        let mut storage = FileStorage::open(data_dir.join("raft"), config.storage.fsync)?;
        let engine = KvEngine::open(&data_dir.join("kv"), config.engine_options())?;
        let raft = recover(&config, &mut storage, &engine)?;
        let engine = Arc::new(RwLock::new(engine));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let timer_reset = Arc::new(Notify::new());
        let directory = Directory::new(config.client_addrs());
        let mut tasks = Vec::new();

        let client_listener = match config.client_listen_addr() {
            Some(addr) => Some(TcpListener::bind(&addr).await?),
            None => None,
        };
        let client_addr = match &client_listener {
            Some(listener) => Some(advertised_client_addr(&config, listener)?),
            None => None,
        };
        if let Some(addr) = &client_addr {
            directory.insert(id, addr.clone());
        }

        let (transport, inbound, peer_addr) = match network {
            Network::Tcp => {
                let listen = config.peer_listen_addr().ok_or_else(|| {
                    ConfigError::Invalid(format!("no peer address for node {id}"))
                })?;
                let listener = TcpListener::bind(&listen).await?;
                let peer_addr = listener.local_addr()?.to_string();
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                tasks.push(tokio::spawn(serve_peers(
                    listener,
                    id,
                    config.cluster_token.clone(),
                    inbound_tx,
                    directory.clone(),
                    config.rpc_timeout(),
                    shutdown_rx.clone(),
                )));
                let hello = Hello {
                    from: id,
                    cluster_token: config.cluster_token.clone(),
                    client_addr: client_addr.clone(),
                };
                let (transport, writers) = TcpTransport::start(
                    config.peers(),
                    hello,
                    config.rpc_timeout(),
                    shutdown_rx.clone(),
                );
                tasks.extend(writers);
                let transport: Arc<dyn Transport> = Arc::new(transport);
                (transport, inbound_rx, Some(peer_addr))
            }
            Network::Local(network) => {
                let (transport, inbound_rx) = network.register(id);
                let transport: Arc<dyn Transport> = Arc::new(transport);
                (transport, inbound_rx, None)
            }
        };

        let settings = TimerSettings {
            election_timeout_min: Duration::from_millis(config.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(config.raft.heartbeat_interval_ms),
        };
        tasks.push(tokio::spawn(run_timer(
            settings,
            events_tx.clone(),
            timer_reset.clone(),
            shutdown_rx.clone(),
        )));

        let worker = Worker::new(
            raft,
            Box::new(storage),
            engine.clone(),
            transport,
            directory,
            WorkerChannels {
                events: events_rx,
                inbound,
                timer_reset,
                shutdown: shutdown_rx.clone(),
            },
            config.raft.snapshot_threshold,
        );
        let worker = tokio::spawn(worker.run());

        let service = KvService::new(id, events_tx, engine, config.request_timeout());
        if let Some(listener) = client_listener {
            tasks.push(tokio::spawn(serve_clients(
                listener,
                service.clone(),
                shutdown_rx,
            )));
        }

        info!(
            node = id,
            client = client_addr.as_deref().unwrap_or("-"),
            peer = peer_addr.as_deref().unwrap_or("-"),
            "node started"
        );
        Ok(Self {
            id,
            service,
            client_addr,
            peer_addr,
            shutdown: shutdown_tx,
            worker,
            tasks,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Client handle bound to this node
    pub fn service(&self) -> KvService {
        self.service.clone()
    }

    /// Where this node serves clients, if it does
    pub fn client_addr(&self) -> Option<&str> {
        self.client_addr.as_deref()
    }

    /// Bound peer address (tcp network only)
    pub fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    /// A receiver that flips to `true` when the node stops
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop every task and wait for them
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        let _ = self.shutdown.send(true);
        let worker = (&mut self.worker).await;
        self.join(worker).await
    }

    /// Run until `signal` resolves or the worker fails, then stop everything
    pub async fn run_until_shutdown<F>(mut self, signal: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        let worker = tokio::select! {
            _ = signal => {
                info!(node = self.id, "shutdown requested");
                let _ = self.shutdown.send(true);
                (&mut self.worker).await
            }
            worker = &mut self.worker => worker,
        };
        self.join(worker).await
    }

    async fn join(self, worker: Result<Result<(), NodeError>, JoinError>) -> Result<(), NodeError> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(node = self.id, error = %e, "task ended abnormally");
            }
        }
        info!(node = self.id, "node stopped");
        worker?
    }
}

/// Rebuild raft state from disk and line it up with the engine.
///
/// The engine may be ahead of the log when a snapshot install was cut short;
/// the log is then moved up to the engine. An engine behind the compacted
/// prefix cannot be repaired.
fn recover(
    config: &NodeConfig,
    storage: &mut dyn RaftStorage,
    engine: &KvEngine,
) -> Result<RaftNode, NodeError> {
    let hard_state = storage.load_hard_state()?;
    let mut log = storage.load_log()?;
    let applied = engine.applied_index();

    if applied > log.last_index() {
        warn!(
            node = config.id,
            applied,
            last_index = log.last_index(),
            "engine is ahead of the log, moving the log to the engine snapshot"
        );
        storage.compact_log(applied, engine.applied_term())?;
        log = storage.load_log()?;
    }
    if log.snapshot_index > applied {
        return Err(NodeError::Inconsistent(format!(
            "log compacted through index {} but the engine only holds {}",
            log.snapshot_index, applied
        )));
    }

    info!(
        node = config.id,
        term = hard_state.term,
        voted_for = ?hard_state.voted_for,
        snapshot_index = log.snapshot_index,
        last_index = log.last_index(),
        applied,
        revision = engine.revision(),
        "recovered local state"
    );
    Ok(RaftNode::restore(
        config.id,
        config.member_ids(),
        config.raft_config(),
        hard_state,
        log.into_raft_log(),
        applied,
    ))
}

/// The configured member address when there is one, else the bound socket
fn advertised_client_addr(config: &NodeConfig, listener: &TcpListener) -> Result<String, NodeError> {
    let configured = config.member(config.id).and_then(|m| m.client_addr.clone());
    match configured {
        Some(addr) => Ok(addr),
        None => Ok(listener.local_addr()?.to_string()),
    }
}
