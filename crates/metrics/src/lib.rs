//! Metrics and tracing setup for fibo replicas and the gateway.
//!
//! Provides a global [`FiboMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping that stops
//! when its shutdown future resolves.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<FiboMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static FiboMetrics {
    METRICS.get_or_init(FiboMetrics::new)
}

/// All Prometheus metrics for a fibo process.
pub struct FiboMetrics {
    pub registry: Registry,

    // ── Replica side ──
    /// One increment per served call, labelled `method`, `server_name`, `mode`.
    pub grpc_requests: IntCounterVec,

    // ── Gateway side ──
    pub calls_sent: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,
    pub batch_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for FiboMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiboMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for call and batch latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl FiboMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let grpc_requests = IntCounterVec::new(
            Opts::new("grpc_requests_total", "Total number of gRPC requests"),
            &["method", "server_name", "mode"],
        )
        .expect("grpc_requests counter vec");

        let calls_sent = IntCounterVec::new(
            Opts::new(
                "fibo_calls_sent_total",
                "Outbound replica calls, by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .expect("calls_sent counter vec");

        let rpc_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "fibo_rpc_latency_seconds",
                "Replica call latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )
        .expect("rpc_latency_secs histogram");

        let batch_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "fibo_batch_latency_seconds",
                "Fan-out batch latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )
        .expect("batch_latency_secs histogram");

        registry
            .register(Box::new(grpc_requests.clone()))
            .expect("register grpc_requests");
        registry
            .register(Box::new(calls_sent.clone()))
            .expect("register calls_sent");
        registry
            .register(Box::new(rpc_latency_secs.clone()))
            .expect("register rpc_latency_secs");
        registry
            .register(Box::new(batch_latency_secs.clone()))
            .expect("register batch_latency_secs");

        Self {
            registry,
            grpc_requests,
            calls_sent,
            rpc_latency_secs,
            batch_latency_secs,
        }
    }
}

/// Count one served request on a replica.
pub fn record_request(method: &str, server_name: &str, mode: &str) {
    metrics()
        .grpc_requests
        .with_label_values(&[method, server_name, mode])
        .inc();
}

/// Count one outbound call with its outcome (`ok`, `error`, ...).
pub fn record_call(operation: &str, outcome: &str) {
    metrics()
        .calls_sent
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a call latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_rpc_timer(operation: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[operation])
        .start_timer()
}

/// Helper: start a batch latency timer.
pub fn start_batch_timer(operation: &str) -> prometheus::HistogramTimer {
    metrics()
        .batch_latency_secs
        .with_label_values(&[operation])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`) until
/// `shutdown` resolves. The listening socket is closed on return.
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics<F>(
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    tokio::pin!(shutdown);
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                tracing::info!("metrics server on {} stopped", addr);
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
