//! Configuration schema and loader for fibo replicas and the gateway.
//!
//! Both binaries read an optional YAML file and then apply the environment
//! variables the deployment manifests set (`POD_NAME`, `SERVER_NAME`, ...).
//! Environment values win over file values.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// ---------------------------------------------------------------------------
// Replica server
// ---------------------------------------------------------------------------

/// Top-level replica (gRPC server) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC listen address.
    #[serde(default = "default_server_listen")]
    pub listen: SocketAddr,

    /// Replica identity reported in every response (`POD_NAME`).
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Deployment mode label attached to request metrics (`MODE`).
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Runtime worker threads (`WORKERS`).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How the increment counter is protected.
    #[serde(default)]
    pub counter_model: CounterModelKind,

    /// Prometheus metrics HTTP port. `None` disables the endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: Option<u16>,

    /// How long to wait for in-flight calls after a shutdown signal.
    /// `None` waits until every call has drained.
    #[serde(default)]
    pub shutdown_grace_ms: Option<u64>,
}

/// Counter protection model.
///
/// `locked` matches the thread-pool deployment: any worker may mutate the
/// counter under a mutex. `serialized` matches the event-loop deployment:
/// one task owns the counter and applies increments in arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterModelKind {
    #[default]
    Locked,
    Serialized,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_server_listen(),
            server_name: default_server_name(),
            mode: default_mode(),
            workers: default_workers(),
            counter_model: CounterModelKind::default(),
            metrics_port: default_metrics_port(),
            shutdown_grace_ms: None,
        }
    }
}

impl ServerConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.server_name.is_empty() {
            return Err(ConfigError::Invalid("server_name must not be empty".into()));
        }
        if self.metrics_port == Some(self.listen.port()) {
            return Err(ConfigError::Invalid(format!(
                "metrics_port ({}) must differ from the gRPC listen port",
                self.listen.port()
            )));
        }
        Ok(())
    }

    /// Apply `POD_NAME`, `MODE` and `WORKERS` overrides.
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = env("POD_NAME") {
            self.server_name = name;
        }
        if let Some(mode) = env("MODE") {
            self.mode = mode;
        }
        if let Some(workers) = env("WORKERS") {
            self.workers = parse_env("WORKERS", &workers)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway (HTTP facade + fan-out client)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listen address.
    #[serde(default = "default_gateway_listen")]
    pub listen: SocketAddr,

    /// Name sent with increment calls when the request carries none (`POD_NAME`).
    #[serde(default = "default_pod_name")]
    pub pod_name: String,

    /// Maximum calls in flight per batch (`WORKERS`).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Where the replicas live.
    #[serde(default)]
    pub target: TargetConfig,

    /// gRPC connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for a whole batch. `None` lets batches run to completion.
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Service DNS name (`SERVER_NAME`).
    #[serde(default = "default_target_host")]
    pub host: String,

    /// Service port (`SERVER_PORT`).
    #[serde(default = "default_target_port")]
    pub port: u16,

    /// `normal` or `headless` (`GRPC_SERVER_SVC_TYPE`).
    #[serde(default)]
    pub svc_type: SvcType,

    /// Fixed `host:port` list used instead of DNS when non-empty.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// How often a headless target is re-resolved, in seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

/// Kubernetes service flavour the gateway talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvcType {
    /// One virtual address; no client-side balancing.
    #[default]
    Normal,
    /// One DNS name per replica set; the client rotates over every address.
    Headless,
}

impl std::str::FromStr for SvcType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(SvcType::Normal),
            "headless" => Ok(SvcType::Headless),
            other => Err(ConfigError::Invalid(format!(
                "svc_type must be \"normal\" or \"headless\", got {:?}",
                other
            ))),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_target_host(),
            port: default_target_port(),
            svc_type: SvcType::default(),
            addresses: Vec::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_gateway_listen(),
            pod_name: default_pod_name(),
            workers: default_workers(),
            target: TargetConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            batch_timeout_ms: None,
            metrics_port: None,
        }
    }
}

impl GatewayConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.target.addresses.is_empty() {
            if self.target.host.is_empty() {
                return Err(ConfigError::Invalid("target.host must not be empty".into()));
            }
            if self.target.port == 0 {
                return Err(ConfigError::Invalid("target.port must be > 0".into()));
            }
        }
        for addr in &self.target.addresses {
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "target.addresses entry {:?} is not host:port",
                        addr
                    )))
                }
            }
        }
        if self.target.svc_type == SvcType::Headless && self.target.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "target.refresh_interval_secs must be > 0 for headless targets".into(),
            ));
        }
        if self.batch_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("batch_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `POD_NAME`, `SERVER_NAME`, `SERVER_PORT`,
    /// `GRPC_SERVER_SVC_TYPE` and `WORKERS` overrides.
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = env("POD_NAME") {
            self.pod_name = name;
        }
        if let Some(host) = env("SERVER_NAME") {
            self.target.host = host;
        }
        if let Some(port) = env("SERVER_PORT") {
            self.target.port = parse_env("SERVER_PORT", &port)?;
        }
        if let Some(svc_type) = env("GRPC_SERVER_SVC_TYPE") {
            self.target.svc_type = svc_type.parse()?;
        }
        if let Some(workers) = env("WORKERS") {
            self.workers = parse_env("WORKERS", &workers)?;
        }
        Ok(())
    }
}

// --- Defaults ---

fn default_server_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50051))
}
fn default_gateway_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}
fn default_server_name() -> String {
    "server".to_string()
}
fn default_mode() -> String {
    "Normal".to_string()
}
fn default_pod_name() -> String {
    "client".to_string()
}
fn default_workers() -> usize {
    1
}
fn default_metrics_port() -> Option<u16> {
    Some(8000)
}
fn default_target_host() -> String {
    "localhost".to_string()
}
fn default_target_port() -> u16 {
    50051
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Parse a `ServerConfig` from YAML without touching the environment.
pub fn server_from_str(yaml: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Parse a `GatewayConfig` from YAML without touching the environment.
pub fn gateway_from_str(yaml: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Load the replica config: optional YAML file, then process environment.
pub fn load_server_config(path: Option<&std::path::Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    config.apply_env(process_env)?;
    config.validate()?;
    Ok(config)
}

/// Load the gateway config: optional YAML file, then process environment.
pub fn load_gateway_config(path: Option<&std::path::Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(process_env)?;
    config.validate()?;
    Ok(config)
}
