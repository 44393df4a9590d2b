//! # client
//!
//! what: KvClient, a tcp client for the node's client port (one request in flight per connection)
//!
//! Connecting and every call are bounded by the timeout given to `connect`.
//! After a timed-out call the connection is in an unknown state; drop the client.

use std::future::Future;
use std::io;
use std::time::Duration;

use kvraft_storage::KeyValue;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::{read_frame, write_frame};
use crate::error::KvError;
use crate::server::{ClientReply, ClientRequest};
use crate::service::{NodeStatus, ReadOptions};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("server closed the connection")]
    Closed,
    #[error("reply does not match the request")]
    UnexpectedReply,
    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
pub struct KvClient {
    addr: String,
    stream: TcpStream,
    timeout: Duration,
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    timeout(limit, fut)
        .await
        .unwrap_or(Err(ClientError::Timeout(limit)))
}

impl KvClient {
    pub async fn connect(addr: impl Into<String>, limit: Duration) -> Result<Self, ClientError> {
        let addr = addr.into();
        let stream = bounded(limit, async {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
        .await?;
        Ok(Self {
            addr,
            stream,
            timeout: limit,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<u64, ClientError> {
        let request = ClientRequest::Put {
            key: key.into(),
            value: value.into(),
        };
        match self.call(&request).await? {
            ClientReply::Revision(revision) => Ok(revision),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<u64, ClientError> {
        let request = ClientRequest::Delete { key: key.into() };
        match self.call(&request).await? {
            ClientReply::Revision(revision) => Ok(revision),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn get(
        &mut self,
        key: impl Into<Vec<u8>>,
        options: ReadOptions,
    ) -> Result<KeyValue, ClientError> {
        let request = ClientRequest::Get {
            key: key.into(),
            options,
        };
        match self.call(&request).await? {
            ClientReply::Value(kv) => Ok(kv),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn status(&mut self) -> Result<NodeStatus, ClientError> {
        match self.call(&ClientRequest::Status).await? {
            ClientReply::Status(status) => Ok(status),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn campaign(&mut self) -> Result<(), ClientError> {
        match self.call(&ClientRequest::Campaign).await? {
            ClientReply::Done => Ok(()),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    async fn call(&mut self, request: &ClientRequest) -> Result<ClientReply, ClientError> {
        let stream = &mut self.stream;
        bounded(self.timeout, async move {
            write_frame(&mut *stream, request).await?;
            let reply: Option<Result<ClientReply, KvError>> = read_frame(&mut *stream).await?;
            match reply {
                Some(result) => Ok(result?),
                None => Err(ClientError::Closed),
            }
        })
        .await
    }
}
