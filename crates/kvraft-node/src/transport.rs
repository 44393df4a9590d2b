//! # transport
//!
//! why: move raft envelopes between members without the worker ever waiting on the network
//! relations: the worker sends through `Transport`; inbound envelopes arrive on an mpsc the worker drains
//! what: Transport trait, TcpTransport (per-peer queue + writer task), serve_peers, LocalNetwork for tests
//!
//! Peer wire protocol: the dialing side sends one `Hello` frame, then a stream
//! of `Envelope` frames. Frames use the codec in codec.rs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kvraft_core::{Envelope, NodeId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame};

const PEER_QUEUE_DEPTH: usize = 1024;
const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to node {0}")]
    UnknownPeer(NodeId),
    #[error("outbound queue to node {0} is full")]
    QueueFull(NodeId),
    #[error("transport is shut down")]
    Closed,
}

/// Fire-and-forget delivery of raft envelopes.
///
/// `send` never blocks; raft recovers lost messages by retrying.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Client addresses of members, learned from config and peer handshakes
#[derive(Debug, Clone, Default)]
pub struct Directory {
    addrs: Arc<RwLock<HashMap<NodeId, String>>>,
}

impl Directory {
    pub fn new(addrs: HashMap<NodeId, String>) -> Self {
        Self {
            addrs: Arc::new(RwLock::new(addrs)),
        }
    }

    pub fn client_addr(&self, id: NodeId) -> Option<String> {
        self.addrs.read().get(&id).cloned()
    }

    pub fn insert(&self, id: NodeId, addr: String) {
        self.addrs.write().insert(id, addr);
    }
}

/// First frame on every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub from: NodeId,
    pub cluster_token: String,
    /// where the dialing node serves clients, if it does
    pub client_addr: Option<String>,
}

// -- tcp transport --

/// Outbound side of the TCP peer network: one bounded queue and one writer task per peer.
#[derive(Debug)]
pub struct TcpTransport {
    queues: HashMap<NodeId, mpsc::Sender<Envelope>>,
}

impl TcpTransport {
    /// Spawn a writer task for every peer
    pub fn start(
        peers: HashMap<NodeId, String>,
        hello: Hello,
        rpc_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut queues = HashMap::new();
        let mut handles = Vec::new();
        for (peer, addr) in peers {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
            queues.insert(peer, tx);
            handles.push(tokio::spawn(peer_writer(
                peer,
                addr,
                hello.clone(),
                rx,
                rpc_timeout,
                shutdown.clone(),
            )));
        }
        (Self { queues }, handles)
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let to = envelope.to;
        let queue = self.queues.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        queue.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(to),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

async fn connect(addr: &str, hello: &Hello) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, hello).await?;
    Ok(stream)
}

/// Keep one connection to `peer` alive and drain its queue into it
async fn peer_writer(
    peer: NodeId,
    addr: String,
    hello: Hello,
    mut queue: mpsc::Receiver<Envelope>,
    rpc_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        let attempt = tokio::select! {
            _ = shutdown.changed() => return,
            attempt = timeout(rpc_timeout, connect(&addr, &hello)) => attempt,
        };
        let mut stream = match attempt {
            Ok(Ok(stream)) => {
                debug!(peer, addr = %addr, "connected to peer");
                backoff = MIN_BACKOFF;
                stream
            }
            Ok(Err(e)) => {
                debug!(peer, addr = %addr, error = %e, "peer connect failed");
                // raft resends whatever matters; stale traffic only delays catch-up
                while queue.try_recv().is_ok() {}
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(_) => {
                debug!(peer, addr = %addr, "peer connect timed out");
                while queue.try_recv().is_ok() {}
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => return,
                envelope = queue.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };
            match timeout(rpc_timeout, write_frame(&mut stream, &envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(peer, error = %e, "peer write failed, reconnecting");
                    break;
                }
                Err(_) => {
                    debug!(peer, "peer write timed out, reconnecting");
                    break;
                }
            }
        }
    }
}

/// Accept peer connections and forward their envelopes to `inbound`
pub async fn serve_peers(
    listener: TcpListener,
    id: NodeId,
    cluster_token: String,
    inbound: mpsc::UnboundedSender<Envelope>,
    directory: Directory,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(node = id, remote = %remote, "peer connection accepted");
                    connections.spawn(handle_peer_connection(
                        stream,
                        id,
                        cluster_token.clone(),
                        inbound.clone(),
                        directory.clone(),
                        handshake_timeout,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(node = id, error = %e, "peer accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn handle_peer_connection(
    mut stream: TcpStream,
    id: NodeId,
    cluster_token: String,
    inbound: mpsc::UnboundedSender<Envelope>,
    directory: Directory,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let hello: Hello = match timeout(handshake_timeout, read_frame(&mut stream)).await {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(node = id, error = %e, "bad peer handshake");
            return;
        }
        Err(_) => {
            debug!(node = id, "peer handshake timed out");
            return;
        }
    };
    if hello.cluster_token != cluster_token {
        warn!(node = id, from = hello.from, "peer presented the wrong cluster token, closing");
        return;
    }
    if let Some(addr) = hello.client_addr.clone() {
        directory.insert(hello.from, addr);
    }
    info!(node = id, peer = hello.from, "peer connected");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = read_frame::<_, Envelope>(&mut stream) => frame,
        };
        match frame {
            Ok(Some(envelope)) => {
                if envelope.to != id || envelope.from != hello.from {
                    warn!(node = id, from = envelope.from, to = envelope.to, "misaddressed envelope dropped");
                    continue;
                }
                if inbound.send(envelope).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(node = id, peer = hello.from, "peer disconnected");
                return;
            }
            Err(e) => {
                debug!(node = id, peer = hello.from, error = %e, "peer stream failed");
                return;
            }
        }
    }
}

// -- in-process network --

#[derive(Debug, Default)]
struct LocalState {
    mailboxes: HashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    isolated: HashSet<NodeId>,
    blocked: HashSet<(NodeId, NodeId)>,
}

/// In-process network with partition controls, for deterministic cluster tests.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<LocalState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach node `id`, replacing any earlier registration (a restarted node)
    pub fn register(&self, id: NodeId) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().mailboxes.insert(id, tx);
        let transport = LocalTransport {
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Cut `id` off from every other node in both directions
    pub fn isolate(&self, id: NodeId) {
        self.state.lock().isolated.insert(id);
    }

    /// Drop traffic from `from` to `to` (one direction only)
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.state.lock().blocked.insert((from, to));
    }

    /// Remove every partition
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.isolated.clear();
        state.blocked.clear();
    }

    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        let state = self.state.lock();
        let (from, to) = (envelope.from, envelope.to);
        if state.isolated.contains(&from)
            || state.isolated.contains(&to)
            || state.blocked.contains(&(from, to))
        {
            return Ok(());
        }
        let mailbox = state.mailboxes.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        mailbox.send(envelope).map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.network.deliver(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvraft_core::RaftMessage;

    fn vote(from: NodeId, to: NodeId) -> Envelope {
        Envelope::new(
            from,
            to,
            RaftMessage::VoteResponse {
                term: 1,
                vote_granted: true,
            },
        )
    }

    #[test]
    fn local_network_delivers_and_partitions() {
        let network = LocalNetwork::new();
        let (t1, mut rx1) = network.register(1);
        let (t2, mut rx2) = network.register(2);

        t1.send(vote(1, 2)).unwrap();
        assert_eq!(rx2.try_recv().unwrap(), vote(1, 2));

        network.isolate(2);
        t1.send(vote(1, 2)).unwrap();
        t2.send(vote(2, 1)).unwrap();
        assert!(rx2.try_recv().is_err());
        assert!(rx1.try_recv().is_err());

        network.heal();
        network.block(2, 1);
        t1.send(vote(1, 2)).unwrap();
        t2.send(vote(2, 1)).unwrap();
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        assert!(matches!(t1.send(vote(1, 9)), Err(TransportError::UnknownPeer(9))));
    }

    #[test]
    fn directory_learns_addresses() {
        let directory = Directory::default();
        assert_eq!(directory.client_addr(1), None);
        directory.insert(1, "127.0.0.1:3011".into());
        assert_eq!(directory.client_addr(1).as_deref(), Some("127.0.0.1:3011"));
    }

    #[tokio::test]
    async fn tcp_handshake_and_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let directory = Directory::default();

        let server = tokio::spawn(serve_peers(
            listener,
            2,
            "token".into(),
            inbound_tx,
            directory.clone(),
            Duration::from_secs(1),
            shutdown_rx.clone(),
        ));

        let hello = Hello {
            from: 1,
            cluster_token: "token".into(),
            client_addr: Some("127.0.0.1:3011".into()),
        };
        let (transport, writers) = TcpTransport::start(
            HashMap::from([(2, addr)]),
            hello,
            Duration::from_secs(1),
            shutdown_rx,
        );
        transport.send(vote(1, 2)).unwrap();

        let received = timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vote(1, 2));
        assert_eq!(directory.client_addr(1).as_deref(), Some("127.0.0.1:3011"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn wrong_token_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve_peers(
            listener,
            2,
            "token".into(),
            inbound_tx,
            Directory::default(),
            Duration::from_secs(1),
            shutdown_rx,
        ));

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let hello = Hello {
            from: 1,
            cluster_token: "wrong".into(),
            client_addr: None,
        };
        write_frame(&mut stream, &hello).await.unwrap();
        let _ = write_frame(&mut stream, &vote(1, 2)).await;

        // the server closes the connection without reading on
        let closed: std::io::Result<Option<Envelope>> =
            timeout(Duration::from_secs(5), read_frame(&mut stream)).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert!(inbound_rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
