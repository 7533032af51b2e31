//! gRPC client implementing `ReplicaTransport`.
//!
//! `GrpcTransport` keeps one tonic channel per replica address. Channels
//! are created lazily, so building a transport (or a channel on top of it)
//! never waits for a replica to be up.

use crate::convert;
use fibo_lb::rpc::{CallError, CallRequest, ReplicaAddr, ReplicaTransport, Reply};
use fibo_proto::fibonacci::fibonacci_service_client::FibonacciServiceClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, Clone)]
pub struct GrpcTransport {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    channels: Arc<RwLock<HashMap<ReplicaAddr, Channel>>>,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout: None,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Per-call timeout applied by tonic.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    async fn get_channel(&self, target: &ReplicaAddr) -> Result<Channel, CallError> {
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(target) {
                return Ok(channel.clone());
            }
        }

        let mut endpoint = Endpoint::from_shared(target.uri())
            .map_err(|e| CallError::Unreachable {
                addr: target.clone(),
                reason: format!("invalid endpoint: {}", e),
            })?
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        let channel = endpoint.connect_lazy();

        let mut cache = self.channels.write().await;
        // Another caller may have raced us here; keep whichever landed first.
        let channel = cache.entry(target.clone()).or_insert(channel).clone();
        tracing::debug!("opened channel to {}", target);
        Ok(channel)
    }

    /// Forget the cached channel for `target`.
    pub async fn invalidate(&self, target: &ReplicaAddr) {
        self.channels.write().await.remove(target);
    }

    pub async fn cached_channels(&self) -> usize {
        self.channels.read().await.len()
    }
}

fn failed(target: &ReplicaAddr, status: tonic::Status) -> CallError {
    let err = convert::call_error_from_status(target, status);
    tracing::debug!("call to {} failed: {}", target, err);
    err
}

#[async_trait::async_trait]
impl ReplicaTransport for GrpcTransport {
    async fn call(&self, target: &ReplicaAddr, request: &CallRequest) -> Result<Reply, CallError> {
        let channel = self.get_channel(target).await?;
        let mut client = FibonacciServiceClient::new(channel);

        match request {
            CallRequest::Increment { name } => {
                let resp = client
                    .increment(convert::increment_request(name))
                    .await
                    .map_err(|status| failed(target, status))?;
                Ok(convert::reply_from_increment(resp.into_inner()))
            }
            CallRequest::Fibonacci { n } => {
                let resp = client
                    .fibonacci(convert::fibonacci_request(*n))
                    .await
                    .map_err(|status| failed(target, status))?;
                convert::reply_from_fibonacci(target, resp.into_inner())
            }
        }
    }

    async fn close(&self) {
        let mut cache = self.channels.write().await;
        tracing::debug!("closing {} cached channel(s)", cache.len());
        cache.clear();
    }
}
