//! Turning a target description into replica addresses.
//!
//! - [`PassthroughResolver`]: hands `host:port` through untouched. A normal
//!   Kubernetes service has one virtual address and the HTTP/2 client does
//!   its own lookup, so every call lands on whatever that address routes to.
//! - [`DnsResolver`]: looks up every A/AAAA record behind a headless
//!   service name, one address per replica.
//! - [`StaticResolver`]: a fixed list, for local runs and tests.

use crate::rpc::ReplicaAddr;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("lookup of {target} failed: {source}")]
    Lookup {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Produces the current set of replica addresses.
///
/// An empty result is a valid view (nothing is up yet), not an error.
#[async_trait::async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self) -> Result<Vec<ReplicaAddr>, ResolveError>;

    /// Human-readable target, for logs and errors.
    fn target(&self) -> String;
}

fn check_host_port(host: &str, port: u16) -> Result<(), ResolveError> {
    if host.is_empty() {
        return Err(ResolveError::InvalidTarget("host must not be empty".into()));
    }
    if port == 0 {
        return Err(ResolveError::InvalidTarget(format!(
            "port for {} must be > 0",
            host
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PassthroughResolver {
    addr: ReplicaAddr,
}

impl PassthroughResolver {
    pub fn new(host: &str, port: u16) -> Result<Self, ResolveError> {
        check_host_port(host, port)?;
        Ok(Self {
            addr: ReplicaAddr::new(format!("{}:{}", host, port)),
        })
    }
}

#[async_trait::async_trait]
impl Resolve for PassthroughResolver {
    async fn resolve(&self) -> Result<Vec<ReplicaAddr>, ResolveError> {
        Ok(vec![self.addr.clone()])
    }

    fn target(&self) -> String {
        self.addr.to_string()
    }
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DnsResolver {
    host: String,
    port: u16,
}

impl DnsResolver {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ResolveError> {
        let host = host.into();
        check_host_port(&host, port)?;
        Ok(Self { host, port })
    }
}

#[async_trait::async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self) -> Result<Vec<ReplicaAddr>, ResolveError> {
        let found = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| ResolveError::Lookup {
                target: self.target(),
                source,
            })?;

        Ok(ordered(found.map(ReplicaAddr::from)))
    }

    fn target(&self) -> String {
        format!("dns:///{}:{}", self.host, self.port)
    }
}

/// Sort and deduplicate a resolved address list.
///
/// DNS may return records in any order, and repeat them, from one lookup to
/// the next. Rotation runs over this form so it is stable across refreshes
/// and no replica gets a double share.
pub fn ordered(addrs: impl IntoIterator<Item = ReplicaAddr>) -> Vec<ReplicaAddr> {
    let mut addrs: Vec<ReplicaAddr> = addrs.into_iter().collect();
    addrs.sort();
    addrs.dedup();
    addrs
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StaticResolver {
    addrs: Vec<ReplicaAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<ReplicaAddr>) -> Self {
        Self { addrs }
    }
}

#[async_trait::async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self) -> Result<Vec<ReplicaAddr>, ResolveError> {
        Ok(self.addrs.clone())
    }

    fn target(&self) -> String {
        let list: Vec<&str> = self.addrs.iter().map(ReplicaAddr::as_str).collect();
        format!("static:[{}]", list.join(","))
    }
}
