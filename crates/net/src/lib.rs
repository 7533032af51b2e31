//! gRPC networking layer for fibo.
//!
//! Provides:
//! - `FibonacciServiceImpl`: bridges the `FibonacciService` proto to a `Replica`
//! - `GrpcTransport`: implements `ReplicaTransport` over tonic for real network I/O
//! - `build_server`: assembles the service into a tonic `Router`
//! - `serve_with_grace`: serves a router until shutdown, then drains

#![allow(clippy::result_large_err)]

pub mod client;
pub mod convert;
pub mod server;

pub use client::GrpcTransport;
pub use server::FibonacciServiceImpl;

use fibo_proto::fibonacci::fibonacci_service_server::FibonacciServiceServer;
use fibo_replica::Replica;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

/// Build a tonic `Router` serving one replica.
pub fn build_server(replica: Arc<Replica>) -> tonic::transport::server::Router {
    tonic::transport::Server::builder()
        .add_service(FibonacciServiceServer::new(FibonacciServiceImpl { replica }))
}

/// Serve `router` on `addr` until `shutdown` resolves.
///
/// The listener stops accepting at once; in-flight calls then get `grace`
/// to finish (unbounded if `None`) before the server is dropped.
pub async fn serve_with_grace<F>(
    router: tonic::transport::server::Router,
    addr: SocketAddr,
    shutdown: F,
    grace: Option<Duration>,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(router.serve_with_shutdown(addr, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        joined = &mut server => {
            return flatten(joined);
        }
        _ = shutdown => {
            tracing::info!("shutdown requested, draining in-flight calls");
        }
    }
    let _ = stop_tx.send(());

    match grace {
        Some(grace) => match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                tracing::warn!("grace period of {:?} elapsed, dropping open calls", grace);
                server.abort();
                Ok(())
            }
        },
        None => flatten(server.await),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn flatten(
    joined: Result<Result<(), tonic::transport::Error>, tokio::task::JoinError>,
) -> Result<(), ServeError> {
    Ok(joined??)
}
