//! fibo-replica: the state and logic behind one replica.
//!
//! A [`Replica`] answers `Increment` and `Fibonacci` calls on behalf of the
//! gRPC service in `fibo-net`. Each replica owns an independent counter;
//! nothing is shared between replicas.

pub mod counter;

pub use counter::{Counter, CounterModel};

use fibo_common::{FibonacciError, Operation};

/// How a replica identifies itself in responses and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaIdentity {
    pub server_name: String,
    pub mode: String,
}

impl ReplicaIdentity {
    pub fn new(server_name: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            mode: mode.into(),
        }
    }
}

/// Result of one `Increment` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    pub number: i64,
    pub server_name: String,
}

/// Result of one `Fibonacci` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciOutcome {
    pub n: u32,
    pub value: u128,
    pub server_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] FibonacciError),
    #[error("counter task is no longer running")]
    CounterClosed,
    #[error("compute worker failed: {0}")]
    Worker(String),
}

/// One replica's state: identity plus its private counter.
#[derive(Debug)]
pub struct Replica {
    identity: ReplicaIdentity,
    counter: Counter,
}

impl Replica {
    /// Create a replica. A [`CounterModel::Serialized`] counter spawns its
    /// owning task, so this must run inside a Tokio runtime.
    pub fn new(identity: ReplicaIdentity, model: CounterModel) -> Self {
        tracing::info!(
            server_name = %identity.server_name,
            mode = %identity.mode,
            ?model,
            "replica created"
        );
        Self {
            identity,
            counter: Counter::new(model),
        }
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    /// Bump this replica's counter and report the new value.
    pub async fn increment(&self, client_name: &str) -> Result<IncrementOutcome, ReplicaError> {
        self.record(Operation::Increment);

        let number = self.counter.increment().await?;
        tracing::info!(
            "Server: {} answered client {} with number {}",
            self.identity.server_name,
            client_name,
            number
        );

        Ok(IncrementOutcome {
            number,
            server_name: self.identity.server_name.clone(),
        })
    }

    /// Compute F(n) on the blocking pool so long loops never stall the
    /// runtime's I/O workers.
    pub async fn fibonacci(&self, n: i64) -> Result<FibonacciOutcome, ReplicaError> {
        self.record(Operation::Fibonacci);

        let index = fibo_common::validate_index(n)?;
        let value = tokio::task::spawn_blocking(move || fibo_common::fibonacci(index))
            .await
            .map_err(|e| ReplicaError::Worker(e.to_string()))?;

        tracing::debug!(
            "Server: {} answered client with Fibonacci({}) = {}",
            self.identity.server_name,
            index,
            value
        );
        tracing::info!(
            "Server: {} answered client with Fibonacci({})",
            self.identity.server_name,
            index
        );

        Ok(FibonacciOutcome {
            n: index,
            value,
            server_name: self.identity.server_name.clone(),
        })
    }

    /// Current counter value.
    pub async fn count(&self) -> Result<i64, ReplicaError> {
        self.counter.get().await
    }

    /// Stop the counter and log its final value.
    pub async fn shutdown(&self) -> Result<i64, ReplicaError> {
        let total = self.counter.stop().await?;
        tracing::info!(
            "Server: {} shutting down after {} increment(s)",
            self.identity.server_name,
            total
        );
        Ok(total)
    }

    fn record(&self, op: Operation) {
        fibo_metrics::record_request(
            op.as_str(),
            &self.identity.server_name,
            &self.identity.mode,
        );
    }
}
