//! A logical channel to one or many replicas.
//!
//! `LbChannel` couples a resolver (where are the replicas?), a selector
//! (which one takes this call?) and a transport (how do bytes get there?).
//! Creating a channel does no I/O: addresses are resolved on the first call
//! and connections are made by the transport when first used.

use crate::resolver::{
    self, DnsResolver, PassthroughResolver, Resolve, ResolveError, StaticResolver,
};
use crate::rpc::{CallError, CallRequest, ReplicaAddr, ReplicaTransport, Reply};
use crate::selector::{SelectionPolicy, Selector};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

/// What a channel connects to and how it picks replicas.
#[derive(Clone)]
pub struct ChannelSpec {
    resolver: Arc<dyn Resolve>,
    policy: SelectionPolicy,
    refresh_interval: Option<Duration>,
}

impl std::fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("target", &self.resolver.target())
            .field("policy", &self.policy)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl ChannelSpec {
    /// A normal service: one address, no client-side balancing.
    pub fn normal(host: &str, port: u16) -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: Arc::new(PassthroughResolver::new(host, port)?),
            policy: SelectionPolicy::Direct,
            refresh_interval: None,
        })
    }

    /// A headless service: every address behind `host`, round-robin,
    /// re-resolved every `refresh_interval`.
    pub fn headless(host: &str, port: u16, refresh_interval: Duration) -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: Arc::new(DnsResolver::new(host, port)?),
            policy: SelectionPolicy::RoundRobin,
            refresh_interval: Some(refresh_interval),
        })
    }

    /// A fixed address list.
    pub fn fixed(addrs: Vec<ReplicaAddr>, policy: SelectionPolicy) -> Self {
        Self::custom(Arc::new(StaticResolver::new(addrs)), policy)
    }

    pub fn custom(resolver: Arc<dyn Resolve>, policy: SelectionPolicy) -> Self {
        Self {
            resolver,
            policy,
            refresh_interval: None,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn target(&self) -> String {
        self.resolver.target()
    }
}

/// Lifecycle of a channel's address view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing resolved yet (or the last resolution came back empty).
    Uninitialized,
    /// First resolution in progress.
    Connecting,
    /// At least one address is available.
    Ready,
    /// `close` was called; every call fails.
    Closed,
}

pub struct LbChannel<T: ReplicaTransport> {
    resolver: Arc<dyn Resolve>,
    selector: RwLock<Selector>,
    state: RwLock<ChannelState>,
    refresh_interval: Option<Duration>,
    /// Serializes resolutions so concurrent first calls do not race.
    resolve_lock: Mutex<()>,
    transport: Arc<T>,
}

impl<T: ReplicaTransport> std::fmt::Debug for LbChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbChannel")
            .field("target", &self.resolver.target())
            .finish_non_exhaustive()
    }
}

impl<T: ReplicaTransport> LbChannel<T> {
    pub fn new(spec: ChannelSpec, transport: Arc<T>) -> Self {
        tracing::debug!(?spec, "created channel");
        Self {
            resolver: spec.resolver,
            selector: RwLock::new(Selector::new(spec.policy)),
            state: RwLock::new(ChannelState::Uninitialized),
            refresh_interval: spec.refresh_interval,
            resolve_lock: Mutex::new(()),
            transport,
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// The current address view.
    pub async fn addrs(&self) -> Vec<ReplicaAddr> {
        self.selector.read().await.addrs()
    }

    pub fn target(&self) -> String {
        self.resolver.target()
    }

    /// Send one request to whichever replica the policy picks.
    pub async fn call(&self, request: &CallRequest) -> Result<Reply, CallError> {
        let target = self.pick().await?;
        let op = request.operation();
        let _timer = fibo_metrics::start_rpc_timer(op.as_str());

        let result = self.transport.call(&target, request).await;
        match &result {
            Ok(reply) => {
                fibo_metrics::record_call(op.as_str(), "ok");
                tracing::debug!(%target, server = %reply.server_name, "{} answered", op);
            }
            Err(e) => {
                let outcome = if e.is_connectivity() { "unreachable" } else { "error" };
                fibo_metrics::record_call(op.as_str(), outcome);
                tracing::debug!(%target, "{} failed: {}", op, e);
            }
        }
        result
    }

    async fn pick(&self) -> Result<ReplicaAddr, CallError> {
        if self.state().await == ChannelState::Closed {
            return Err(CallError::Closed);
        }
        if let Some(addr) = self.selector.read().await.next() {
            return Ok(addr);
        }

        // Nothing resolved yet: resolve on demand.
        self.refresh()
            .await
            .map_err(|e| CallError::Resolve(e.to_string()))?;
        self.selector
            .read()
            .await
            .next()
            .ok_or_else(|| CallError::NoAddresses(self.resolver.target()))
    }

    /// Re-resolve the target and swap in the new address view.
    ///
    /// On failure the previous view is kept. Returns the number of
    /// addresses now known.
    pub async fn refresh(&self) -> Result<usize, ResolveError> {
        let _guard = self.resolve_lock.lock().await;
        {
            let mut state = self.state.write().await;
            match *state {
                ChannelState::Closed => return Ok(0),
                ChannelState::Uninitialized => *state = ChannelState::Connecting,
                _ => {}
            }
        }

        let resolved = self.resolver.resolve().await;
        let mut state = self.state.write().await;
        let addrs = match resolved {
            Ok(addrs) => resolver::ordered(addrs),
            Err(e) => {
                if *state == ChannelState::Connecting {
                    *state = ChannelState::Uninitialized;
                }
                tracing::warn!("resolving {} failed: {}", self.resolver.target(), e);
                return Err(e);
            }
        };
        if *state == ChannelState::Closed {
            return Ok(0);
        }

        let count = addrs.len();
        let changed = self.selector.write().await.update(addrs);
        if changed {
            tracing::info!(
                "{} now resolves to {} replica address(es)",
                self.resolver.target(),
                count
            );
        }
        *state = if count > 0 {
            ChannelState::Ready
        } else {
            ChannelState::Uninitialized
        };
        Ok(count)
    }

    /// Spawn periodic re-resolution when the channel has a refresh interval.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.refresh_interval?;
        let channel = self.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if channel.state().await == ChannelState::Closed {
                    break;
                }
                if let Err(e) = channel.refresh().await {
                    tracing::debug!("periodic refresh failed: {}", e);
                }
            }
        }))
    }

    /// Stop serving calls and drop cached connections.
    pub async fn close(&self) {
        *self.state.write().await = ChannelState::Closed;
        self.selector.write().await.update(Vec::new());
        self.transport.close().await;
        tracing::info!("channel to {} closed", self.resolver.target());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addrs(names: &[&str]) -> Vec<ReplicaAddr> {
        names.iter().map(|n| ReplicaAddr::new(*n)).collect()
    }

    /// A resolver whose answer can change between calls.
    struct ScriptedResolver {
        answers: std::sync::Mutex<Vec<Result<Vec<ReplicaAddr>, ()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn new(answers: Vec<Result<Vec<ReplicaAddr>, ()>>) -> Self {
            Self {
                answers: std::sync::Mutex::new(answers),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Resolve for ScriptedResolver {
        async fn resolve(&self) -> Result<Vec<ReplicaAddr>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            let next = if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0].clone()
            };
            next.map_err(|_| ResolveError::Lookup {
                target: "scripted".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            })
        }

        fn target(&self) -> String {
            "scripted".into()
        }
    }

    #[tokio::test]
    async fn test_creation_is_lazy() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok(addrs(&["a:1"]))]));
        let transport = Arc::new(MockTransport::new());
        let channel = LbChannel::new(
            ChannelSpec::custom(resolver.clone(), SelectionPolicy::RoundRobin),
            transport.clone(),
        );

        assert_eq!(channel.state().await, ChannelState::Uninitialized);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.calls(), 0);

        channel
            .call(&CallRequest::Increment { name: "c".into() })
            .await
            .unwrap();
        assert_eq!(channel.state().await, ChannelState::Ready);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_normal_channel_uses_one_backend() {
        let transport = Arc::new(MockTransport::new());
        let spec = ChannelSpec::normal("grpc-server", 50051).unwrap();
        let channel = LbChannel::new(spec, transport.clone());

        for _ in 0..10 {
            let reply = channel
                .call(&CallRequest::Increment { name: "c".into() })
                .await
                .unwrap();
            assert_eq!(reply.server_name, "grpc-server:50051");
        }
        assert_eq!(transport.count_for(&ReplicaAddr::new("grpc-server:50051")), 10);
    }

    #[tokio::test]
    async fn test_round_robin_spreads_calls() {
        let transport = Arc::new(MockTransport::new());
        let spec = ChannelSpec::fixed(addrs(&["r1:1", "r2:1", "r3:1"]), SelectionPolicy::RoundRobin);
        let channel = LbChannel::new(spec, transport.clone());

        let mut servers: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let reply = channel
                .call(&CallRequest::Fibonacci { n: 10 })
                .await
                .unwrap();
            *servers.entry(reply.server_name).or_default() += 1;
        }
        assert_eq!(servers.len(), 3);
        assert!(servers.values().all(|&c| c == 3), "{:?}", servers);
    }

    #[tokio::test]
    async fn test_empty_view_is_connectivity_error() {
        let transport = Arc::new(MockTransport::new());
        let channel = LbChannel::new(
            ChannelSpec::fixed(vec![], SelectionPolicy::RoundRobin),
            transport.clone(),
        );

        let err = channel
            .call(&CallRequest::Fibonacci { n: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoAddresses(_)));
        assert!(err.is_connectivity());
        assert_eq!(channel.state().await, ChannelState::Uninitialized);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_resolution_keeps_previous_view() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Ok(addrs(&["a:1", "b:1"])),
            Err(()),
        ]));
        let channel = LbChannel::new(
            ChannelSpec::custom(resolver, SelectionPolicy::RoundRobin),
            Arc::new(MockTransport::new()),
        );

        assert_eq!(channel.refresh().await.unwrap(), 2);
        assert!(channel.refresh().await.is_err());
        assert_eq!(channel.addrs().await, addrs(&["a:1", "b:1"]));
        assert_eq!(channel.state().await, ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_replicas() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Ok(addrs(&["a:1"])),
            Ok(addrs(&["a:1", "b:1"])),
        ]));
        let transport = Arc::new(MockTransport::new());
        let channel = LbChannel::new(
            ChannelSpec::custom(resolver, SelectionPolicy::RoundRobin),
            transport.clone(),
        );

        channel.refresh().await.unwrap();
        assert_eq!(channel.addrs().await.len(), 1);
        channel.refresh().await.unwrap();
        assert_eq!(channel.addrs().await.len(), 2);

        for _ in 0..4 {
            channel
                .call(&CallRequest::Increment { name: "c".into() })
                .await
                .unwrap();
        }
        assert_eq!(transport.count_for(&ReplicaAddr::new("a:1")), 2);
        assert_eq!(transport.count_for(&ReplicaAddr::new("b:1")), 2);
    }

    #[tokio::test]
    async fn test_rotation_ignores_record_order_and_repeats() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Ok(addrs(&["c:1", "a:1", "c:1", "b:1"])),
            Ok(addrs(&["b:1", "c:1", "a:1", "a:1"])),
        ]));
        let transport = Arc::new(MockTransport::new());
        let channel = LbChannel::new(
            ChannelSpec::custom(resolver, SelectionPolicy::RoundRobin),
            transport.clone(),
        );

        channel.refresh().await.unwrap();
        let first = channel.addrs().await;
        assert_eq!(first, addrs(&["a:1", "b:1", "c:1"]));

        let mut order = Vec::new();
        for _ in 0..6 {
            let reply = channel
                .call(&CallRequest::Increment { name: "c".into() })
                .await
                .unwrap();
            order.push(reply.server_name);
        }
        assert_eq!(order, ["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);

        // Same replicas answered differently: the view does not change.
        channel.refresh().await.unwrap();
        assert_eq!(channel.addrs().await, first);
        for addr in &first {
            assert_eq!(transport.count_for(addr), 2);
        }
    }

    #[tokio::test]
    async fn test_refresh_task_runs_periodically() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok(addrs(&["a:1"]))]));
        let channel = Arc::new(LbChannel::new(
            ChannelSpec::custom(resolver.clone(), SelectionPolicy::RoundRobin)
                .with_refresh_interval(Duration::from_millis(20)),
            Arc::new(MockTransport::new()),
        ));

        let handle = channel.spawn_refresh_task().expect("refresh interval set");
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(resolver.calls.load(Ordering::SeqCst) >= 3);

        channel.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh task should stop after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_refresh_task_without_interval() {
        let channel = Arc::new(LbChannel::new(
            ChannelSpec::normal("svc", 1).unwrap(),
            Arc::new(MockTransport::new()),
        ));
        assert!(channel.spawn_refresh_task().is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_calls() {
        let transport = Arc::new(MockTransport::new());
        let channel = LbChannel::new(
            ChannelSpec::fixed(addrs(&["a:1"]), SelectionPolicy::Direct),
            transport.clone(),
        );
        channel
            .call(&CallRequest::Fibonacci { n: 3 })
            .await
            .unwrap();

        channel.close().await;
        assert_eq!(channel.state().await, ChannelState::Closed);
        assert!(transport.is_closed());

        let err = channel
            .call(&CallRequest::Fibonacci { n: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Closed));
        assert_eq!(channel.refresh().await.unwrap(), 0);
    }
}
