//! Call types and the point-to-point transport abstraction.

use fibo_common::Operation;
use std::fmt;
use std::net::SocketAddr;

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// A replica address in `host:port` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaAddr(String);

impl ReplicaAddr {
    pub fn new(authority: impl Into<String>) -> Self {
        Self(authority.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI form understood by HTTP/2 clients.
    pub fn uri(&self) -> String {
        format!("http://{}", self.0)
    }
}

impl From<SocketAddr> for ReplicaAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for ReplicaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// A single request as sent to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRequest {
    Increment { name: String },
    Fibonacci { n: u32 },
}

impl CallRequest {
    pub fn operation(&self) -> Operation {
        match self {
            CallRequest::Increment { .. } => Operation::Increment,
            CallRequest::Fibonacci { .. } => Operation::Fibonacci,
        }
    }
}

/// One outbound call: the request plus the random input that produced it,
/// when there was one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub request: CallRequest,
    pub tag: Option<u32>,
}

impl CallDescriptor {
    pub fn untagged(request: CallRequest) -> Self {
        Self { request, tag: None }
    }

    /// A Fibonacci call whose result must stay paired with `n`.
    pub fn tagged_fibonacci(n: u32) -> Self {
        Self {
            request: CallRequest::Fibonacci { n },
            tag: Some(n),
        }
    }
}

/// What a replica answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallValue {
    /// The replica's counter after an `Increment`.
    Count(i64),
    /// A Fibonacci value as a decimal string.
    Fibonacci(String),
}

/// A replica's reply, before it is placed in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub server_name: String,
    pub value: CallValue,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("no replica address resolved for {0}")]
    NoAddresses(String),

    #[error("cannot reach {addr}: {reason}")]
    Unreachable { addr: ReplicaAddr, reason: String },

    #[error("address resolution failed: {0}")]
    Resolve(String),

    #[error("{addr} answered {code}: {message}")]
    Remote {
        addr: ReplicaAddr,
        code: String,
        message: String,
    },

    #[error("malformed reply from {addr}: {reason}")]
    MalformedReply { addr: ReplicaAddr, reason: String },

    #[error("channel is closed")]
    Closed,
}

impl CallError {
    /// Whether the call never reached a replica.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            CallError::NoAddresses(_)
                | CallError::Unreachable { .. }
                | CallError::Resolve(_)
                | CallError::Closed
        )
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the wire.
///
/// Implementations can be:
/// - a mock for unit tests (in-process, no real I/O)
/// - `GrpcTransport` in `fibo-net` for real deployment
#[async_trait::async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Send one request to one replica and await its reply.
    async fn call(&self, target: &ReplicaAddr, request: &CallRequest) -> Result<Reply, CallError>;

    /// Release any cached connections.
    async fn close(&self) {}
}
