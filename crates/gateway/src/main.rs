//! fibo-gateway: entry point for the HTTP facade.
//!
//! Loads config (optional YAML path as the first argument, then the
//! environment), opens a load-balanced channel to the replicas and serves
//! the facade until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    fibo_metrics::init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = fibo_config::load_gateway_config(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: fibo_config::GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (state, channel) = fibo_gateway::build_state(&config)?;
    let refresh_task = channel.spawn_refresh_task();

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

    fibo_gateway::run(state, config.listen, shutdown_signal()).await?;

    channel.close().await;
    if let Some(task) = refresh_task {
        task.abort();
    }
    let _ = metrics_stop.send(());
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    tracing::info!("gateway {} stopped", config.pod_name);
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
