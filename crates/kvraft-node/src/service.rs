//! # service
//!
//! why: one typed entry point for clients, whether they arrive over tcp or in-process
//! relations: talks to the worker through Event::Client; stale reads go straight to the shared KvEngine
//! what: KvService (put/delete/get/status/campaign), ReadOptions, Consistency, NodeStatus

use std::sync::Arc;
use std::time::Duration;

use kvraft_core::{Command, NodeId, NodeState};
use kvraft_storage::{KeyValue, KvEngine, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::error::KvError;
use crate::worker::{Event, Request};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Confirmed with a quorum through the leader
    #[default]
    Linearizable,
    /// Whatever this node has applied
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Read as of this revision instead of the latest
    #[serde(default)]
    pub revision: Option<u64>,
    #[serde(default)]
    pub consistency: Consistency,
}

impl ReadOptions {
    pub fn stale() -> Self {
        Self {
            revision: None,
            consistency: Consistency::Stale,
        }
    }

    pub fn at_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub revision: u64,
    pub snapshot_index: u64,
}

/// Client-facing handle to a running node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct KvService {
    id: NodeId,
    events: mpsc::Sender<Event>,
    engine: Arc<RwLock<KvEngine>>,
    request_timeout: Duration,
}

impl KvService {
    pub fn new(
        id: NodeId,
        events: mpsc::Sender<Event>,
        engine: Arc<RwLock<KvEngine>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            events,
            engine,
            request_timeout,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the revision the write produced
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<u64, KvError> {
        self.propose(Command::put(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<u64, KvError> {
        self.propose(Command::delete(key)).await
    }

    pub async fn get(&self, key: impl AsRef<[u8]>, options: ReadOptions) -> Result<KeyValue, KvError> {
        if options.consistency == Consistency::Linearizable {
            // answered only once the engine has applied through the read index
            let index = self.call(|reply| Request::ReadIndex { reply }).await??;
            debug!(node = self.id, index, "read index confirmed");
        }
        let engine = self.engine.read();
        match engine.get(key.as_ref(), options.revision) {
            Ok(Some(kv)) => Ok(kv),
            Ok(None) => Err(KvError::NotFound),
            Err(e @ (StorageError::Compacted { .. } | StorageError::FutureRevision { .. })) => {
                debug!(node = self.id, error = %e, "revision out of range");
                Err(KvError::NotFound)
            }
            Err(e) => {
                debug!(node = self.id, error = %e, "read failed");
                Err(KvError::NotFound)
            }
        }
    }

    pub async fn status(&self) -> Result<NodeStatus, KvError> {
        self.call(|reply| Request::Status { reply }).await
    }

    /// Start an election on this node right away
    pub async fn campaign(&self) -> Result<(), KvError> {
        self.call(|reply| Request::Campaign { reply }).await
    }

    async fn propose(&self, command: Command) -> Result<u64, KvError> {
        self.call(|reply| Request::Propose { command, reply }).await?
    }

    /// Send a request and wait for the reply, bounded by the request timeout.
    /// A worker that is gone counts as a timeout.
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, KvError> {
        let (tx, rx) = oneshot::channel();
        let request = make(tx);
        let exchange = async {
            self.events
                .send(Event::Client(request))
                .await
                .map_err(|_| KvError::Timeout)?;
            rx.await.map_err(|_| KvError::Timeout)
        };
        timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| KvError::Timeout)?
    }
}
