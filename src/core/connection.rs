/// Per-member connection handling
///
/// A `NodeConnection` owns the byte-stream link to a single set member and
/// issues probe and application requests over it, applying the configured
/// timeout to every call. The actual transport sits behind the
/// `MemberTransport` trait so tests can drive an in-process simulated set;
/// `TcpTransport` is the production implementation, speaking a
/// newline-delimited JSON status protocol over TCP.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::core::{Endpoint, ProbeInfo, WriteConcern};
use crate::error::{ClientError, ClientResult};

/// Application operation forwarded to a member. Document contents and the
/// query surface live with external collaborators; the router only needs an
/// opaque operation to hand to the selected connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        collection: String,
        documents: Vec<String>,
        write_concern: WriteConcern,
    },
    Find {
        collection: String,
    },
}

/// Member response to an application operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Response {
    Ack { acknowledged_by: u32 },
    Documents { documents: Vec<String> },
}

/// Byte-stream transport to a single member
#[async_trait]
pub trait MemberTransport: Send + Sync {
    /// Issue a lightweight status request
    async fn probe(&self) -> ClientResult<ProbeInfo>;

    /// Issue an application operation
    async fn execute(&self, op: &Operation) -> ClientResult<Response>;

    /// Release the underlying stream
    async fn close(&self);
}

/// Opens transports for endpoints; the seam the monitor uses to create
/// connections as members are discovered
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> ClientResult<Box<dyn MemberTransport>>;
}

/// One physical connection to a single set member
pub struct NodeConnection {
    endpoint: Endpoint,
    transport: Box<dyn MemberTransport>,
    op_timeout: Duration,
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("endpoint", &self.endpoint)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl NodeConnection {
    /// Establish a connection to `endpoint`, bounded by `op_timeout`. The
    /// same timeout applies to every subsequent probe and execute call.
    pub async fn connect(
        endpoint: Endpoint,
        factory: &dyn TransportFactory,
        op_timeout: Duration,
    ) -> ClientResult<Arc<Self>> {
        let transport = match timeout(op_timeout, factory.open(&endpoint)).await {
            Ok(transport) => transport?,
            Err(_) => {
                return Err(ClientError::timeout(
                    endpoint,
                    "connect",
                    op_timeout.as_millis() as u64,
                ))
            }
        };
        debug!("connected to member {}", endpoint);
        Ok(Arc::new(Self {
            endpoint,
            transport,
            op_timeout,
        }))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Probe the member for its self-reported status
    pub async fn probe(&self) -> ClientResult<ProbeInfo> {
        self.bounded("probe", self.transport.probe()).await
    }

    /// Execute an application operation on this member
    pub async fn execute(&self, op: Operation) -> ClientResult<Response> {
        self.bounded("execute", self.transport.execute(&op)).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> ClientResult<T>
    where
        F: Future<Output = ClientResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout(
                self.endpoint.clone(),
                operation,
                self.op_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Requests crossing the wire, one JSON object per line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum WireRequest {
    Probe,
    Execute { op: Operation },
}

/// Replies crossing the wire, one JSON object per line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WireReply {
    Probe { info: ProbeInfo },
    Executed { response: Response },
    Error { message: String },
}

/// TCP transport speaking the newline-delimited JSON member protocol.
/// Requests are serialized one at a time over the single stream.
pub struct TcpTransport {
    endpoint: Endpoint,
    stream: Mutex<BufStream<TcpStream>>,
}

impl TcpTransport {
    async fn round_trip(&self, request: &WireRequest) -> ClientResult<WireReply> {
        let line = serde_json::to_string(request)?;
        let mut stream = self.stream.lock().await;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reply = String::new();
        let n = stream.read_line(&mut reply).await?;
        if n == 0 {
            return Err(ClientError::protocol(format!(
                "member {} closed the connection",
                self.endpoint
            )));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}

#[async_trait]
impl MemberTransport for TcpTransport {
    async fn probe(&self) -> ClientResult<ProbeInfo> {
        match self.round_trip(&WireRequest::Probe).await? {
            WireReply::Probe { info } => Ok(info),
            WireReply::Error { message } => Err(ClientError::protocol(message)),
            WireReply::Executed { .. } => {
                Err(ClientError::protocol("unexpected execute reply to probe"))
            }
        }
    }

    async fn execute(&self, op: &Operation) -> ClientResult<Response> {
        let request = WireRequest::Execute { op: op.clone() };
        match self.round_trip(&request).await? {
            WireReply::Executed { response } => Ok(response),
            WireReply::Error { message } => Err(ClientError::protocol(message)),
            WireReply::Probe { .. } => {
                Err(ClientError::protocol("unexpected probe reply to execute"))
            }
        }
    }

    async fn close(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.get_mut().shutdown().await;
    }
}

/// Production factory: plain TCP with TCP_NODELAY
pub struct TcpTransportFactory;

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn open(&self, endpoint: &Endpoint) -> ClientResult<Box<dyn MemberTransport>> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransport {
            endpoint: endpoint.clone(),
            stream: Mutex::new(BufStream::new(stream)),
        }))
    }
}
