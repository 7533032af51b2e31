//! fibo-server: entry point for one replica.
//!
//! Loads config (optional YAML path as the first argument, then the
//! environment), builds the replica with the configured counter model and
//! serves `FibonacciService` until Ctrl+C or SIGTERM.

use fibo_config::{CounterModelKind, ServerConfig};
use fibo_replica::{CounterModel, Replica, ReplicaIdentity};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    fibo_metrics::init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = fibo_config::load_server_config(config_path.as_deref())?;

    // `workers` sizes the runtime, so it has to be known before we build it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let model = match config.counter_model {
        CounterModelKind::Locked => CounterModel::Locked,
        CounterModelKind::Serialized => CounterModel::Serialized,
    };
    let identity = ReplicaIdentity::new(&config.server_name, &config.mode);
    let replica = Arc::new(Replica::new(identity, model));

    // Metrics get their own stop signal so the endpoint outlives the drain.
    let (metrics_stop, metrics_stopped) = tokio::sync::oneshot::channel::<()>();
    let metrics_task = config.metrics_port.map(|port| {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = metrics_stopped.await;
            };
            if let Err(e) = fibo_metrics::serve_metrics(addr, shutdown).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        })
    });

    let router = fibo_net::build_server(replica.clone());
    tracing::info!(
        "Server: {} serving gRPC on {} (mode {}, {} worker(s), {:?} counter)",
        config.server_name,
        config.listen,
        config.mode,
        config.workers,
        model
    );

    let grace = config.shutdown_grace_ms.map(Duration::from_millis);
    fibo_net::serve_with_grace(router, config.listen, shutdown_signal(), grace).await?;

    if let Err(e) = replica.shutdown().await {
        tracing::warn!("replica shutdown: {}", e);
    }
    let _ = metrics_stop.send(());
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    tracing::info!("Server: {} stopped", config.server_name);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
