//! # server
//!
//! why: expose KvService to other processes
//! relations: wraps KvService; KvClient (client.rs) speaks the other end; frames from codec.rs
//! what: ClientRequest/ClientReply wire types, serve_clients accept loop, dispatch

use kvraft_storage::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame};
use crate::error::KvError;
use crate::service::{KvService, NodeStatus, ReadOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    Get {
        key: Vec<u8>,
        #[serde(default)]
        options: ReadOptions,
    },
    Status,
    Campaign,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Revision(u64),
    Value(KeyValue),
    Status(NodeStatus),
    Done,
}

/// Run one request against the service
pub async fn dispatch(service: &KvService, request: ClientRequest) -> Result<ClientReply, KvError> {
    match request {
        ClientRequest::Put { key, value } => service.put(key, value).await.map(ClientReply::Revision),
        ClientRequest::Delete { key } => service.delete(key).await.map(ClientReply::Revision),
        ClientRequest::Get { key, options } => service.get(key, options).await.map(ClientReply::Value),
        ClientRequest::Status => service.status().await.map(ClientReply::Status),
        ClientRequest::Campaign => service.campaign().await.map(|()| ClientReply::Done),
    }
}

/// Accept client connections until shutdown; one task per connection
pub async fn serve_clients(
    listener: TcpListener,
    service: KvService,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(node = service.id(), remote = %remote, "client connected");
                    connections.spawn(handle_client(stream, service.clone(), shutdown.clone()));
                }
                Err(e) => warn!(node = service.id(), error = %e, "client accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn handle_client(mut stream: TcpStream, service: KvService, mut shutdown: watch::Receiver<bool>) {
    let _ = stream.set_nodelay(true);
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = read_frame::<_, ClientRequest>(&mut stream) => frame,
        };
        let request = match frame {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(node = service.id(), error = %e, "bad client frame, closing");
                return;
            }
        };
        let reply = dispatch(&service, request).await;
        if let Err(e) = write_frame(&mut stream, &reply).await {
            debug!(node = service.id(), error = %e, "client write failed");
            return;
        }
    }
}
