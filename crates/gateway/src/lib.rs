//! fibo-gateway: the HTTP facade in front of the replicas.
//!
//! Every request becomes a batch on a [`FanOutDispatcher`], which spreads
//! the calls over the replicas its channel resolves to.

pub mod api;

pub use api::ApiError;

use axum::routing::get;
use fibo_config::{GatewayConfig, SvcType};
use fibo_lb::channel::{ChannelSpec, LbChannel};
use fibo_lb::dispatcher::FanOutDispatcher;
use fibo_lb::resolver::ResolveError;
use fibo_lb::rpc::{ReplicaAddr, ReplicaTransport};
use fibo_lb::selector::SelectionPolicy;
use fibo_net::GrpcTransport;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid target: {0}")]
    Target(#[from] ResolveError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Shared state behind every route.
pub struct AppState<T: ReplicaTransport> {
    /// Default client name for `/increment`.
    pub pod_name: String,
    pub dispatcher: Arc<FanOutDispatcher<T>>,
}

impl<T: ReplicaTransport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            pod_name: self.pod_name.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<T: ReplicaTransport> AppState<T> {
    pub fn new(pod_name: impl Into<String>, dispatcher: FanOutDispatcher<T>) -> Self {
        Self {
            pod_name: pod_name.into(),
            dispatcher: Arc::new(dispatcher),
        }
    }
}

pub fn router<T: ReplicaTransport>(state: AppState<T>) -> axum::Router {
    axum::Router::new()
        .route("/increment", get(api::increment::<T>))
        .route("/fibonacci", get(api::fibonacci::<T>))
        .route("/fibonacci/random", get(api::random_fibonacci::<T>))
        .route("/health", get(api::health))
        .with_state(state)
}

/// Serve the facade on `addr` until `shutdown` resolves.
pub async fn run<T, F>(
    state: AppState<T>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), GatewayError>
where
    T: ReplicaTransport,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    tracing::info!("HTTP facade listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(GatewayError::Serve)?;

    tracing::info!("HTTP facade on {} stopped", addr);
    Ok(())
}

/// Describe the channel the config asks for.
///
/// A non-empty `target.addresses` list wins over DNS and is always
/// round-robin.
pub fn channel_spec(config: &GatewayConfig) -> Result<ChannelSpec, ResolveError> {
    let target = &config.target;
    if !target.addresses.is_empty() {
        let addrs = target.addresses.iter().map(ReplicaAddr::new).collect();
        return Ok(ChannelSpec::fixed(addrs, SelectionPolicy::RoundRobin));
    }
    match target.svc_type {
        SvcType::Normal => ChannelSpec::normal(&target.host, target.port),
        SvcType::Headless => ChannelSpec::headless(
            &target.host,
            target.port,
            Duration::from_secs(target.refresh_interval_secs),
        ),
    }
}

/// Build the gRPC channel and dispatcher for `config`.
pub fn build_state(
    config: &GatewayConfig,
) -> Result<(AppState<GrpcTransport>, Arc<LbChannel<GrpcTransport>>), GatewayError> {
    let spec = channel_spec(config)?;
    tracing::info!(
        "gateway {} targets {} ({:?}, concurrency {})",
        config.pod_name,
        spec.target(),
        spec.policy(),
        config.workers
    );

    let transport = GrpcTransport::new(Duration::from_millis(config.connect_timeout_ms));
    let channel = Arc::new(LbChannel::new(spec, Arc::new(transport)));
    let dispatcher = FanOutDispatcher::new(channel.clone())
        .with_default_concurrency(config.workers)
        .with_default_deadline(config.batch_timeout_ms.map(Duration::from_millis));
    Ok((AppState::new(&config.pod_name, dispatcher), channel))
}
