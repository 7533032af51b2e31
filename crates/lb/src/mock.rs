//! In-process transport for unit tests.

use crate::rpc::{CallError, CallRequest, CallValue, ReplicaAddr, ReplicaTransport, Reply};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Each address acts as one replica with its own counter. The reply's
/// `server_name` is the address itself.
#[derive(Default)]
pub(crate) struct MockTransport {
    counters: Mutex<HashMap<ReplicaAddr, i64>>,
    hits: Mutex<HashMap<ReplicaAddr, usize>>,
    unreachable: HashSet<ReplicaAddr>,
    failing: HashSet<ReplicaAddr>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls to `addr` fail as if the replica were down.
    pub(crate) fn with_unreachable(mut self, addr: &str) -> Self {
        self.unreachable.insert(ReplicaAddr::new(addr));
        self
    }

    /// Calls to `addr` reach it but come back with an error status.
    pub(crate) fn with_failing(mut self, addr: &str) -> Self {
        self.failing.insert(ReplicaAddr::new(addr));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn count_for(&self, addr: &ReplicaAddr) -> usize {
        self.hits.lock().unwrap().get(addr).copied().unwrap_or(0)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn fib_string(n: u32) -> String {
    fibo_common::fibonacci(n).to_string()
}

#[async_trait::async_trait]
impl ReplicaTransport for MockTransport {
    async fn call(&self, target: &ReplicaAddr, request: &CallRequest) -> Result<Reply, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.hits.lock().unwrap().entry(target.clone()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains(target) {
            return Err(CallError::Unreachable {
                addr: target.clone(),
                reason: "connection refused".into(),
            });
        }
        if self.failing.contains(target) {
            return Err(CallError::Remote {
                addr: target.clone(),
                code: "Internal".into(),
                message: "replica failed".into(),
            });
        }

        let value = match request {
            CallRequest::Increment { .. } => {
                let mut counters = self.counters.lock().unwrap();
                let c = counters.entry(target.clone()).or_insert(0);
                *c += 1;
                CallValue::Count(*c)
            }
            CallRequest::Fibonacci { n } => CallValue::Fibonacci(fib_string(*n)),
        };
        Ok(Reply {
            server_name: target.to_string(),
            value,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
