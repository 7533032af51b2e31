//! Concurrent fan-out of one logical request over a channel.
//!
//! A batch is `k` calls of the same operation. A call is only spawned into
//! the `JoinSet` once it holds a semaphore permit, so at most `concurrency`
//! call tasks exist at any time and each payload is drawn just before its
//! call is issued. Results are placed back in issue order.
//!
//! The batch fails as a whole: the first call that errors aborts every
//! outstanding call and its partial results are discarded.

use crate::channel::LbChannel;
use crate::rpc::{CallDescriptor, CallError, CallRequest, CallValue, ReplicaTransport};
use fibo_common::{FibonacciError, Operation, MAX_ITERATIONS};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};

/// Used when neither the plan nor the dispatcher sets a limit.
pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("call {index} could not reach a replica: {source}")]
    Connectivity {
        index: usize,
        #[source]
        source: CallError,
    },

    #[error("call {index} failed: {source}")]
    RemoteCallFailure {
        index: usize,
        #[source]
        source: CallError,
    },

    #[error("batch deadline of {timeout:?} exceeded ({completed}/{requested} calls completed)")]
    DeadlineExceeded {
        timeout: Duration,
        completed: usize,
        requested: usize,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FibonacciError> for DispatchError {
    fn from(e: FibonacciError) -> Self {
        DispatchError::InvalidArgument(e.to_string())
    }
}

impl DispatchError {
    fn from_call(index: usize, source: CallError) -> Self {
        if source.is_connectivity() {
            DispatchError::Connectivity { index, source }
        } else {
            DispatchError::RemoteCallFailure { index, source }
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Where each call's payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    Increment { name: String },
    Fibonacci { n: i64 },
    /// A fresh `n`, uniform over `start..=end`, for every call.
    RandomFibonacci { start: i64, end: i64 },
}

enum Payload {
    Fixed(CallDescriptor),
    Range(u32, u32),
}

impl Payload {
    fn draw(&self) -> CallDescriptor {
        match self {
            Payload::Fixed(d) => d.clone(),
            Payload::Range(start, end) => {
                CallDescriptor::tagged_fibonacci(rand::thread_rng().gen_range(*start..=*end))
            }
        }
    }
}

impl PayloadSource {
    pub fn operation(&self) -> Operation {
        match self {
            PayloadSource::Increment { .. } => Operation::Increment,
            PayloadSource::Fibonacci { .. } | PayloadSource::RandomFibonacci { .. } => {
                Operation::Fibonacci
            }
        }
    }

    fn prepare(&self) -> Result<Payload, DispatchError> {
        match self {
            PayloadSource::Increment { name } => Ok(Payload::Fixed(CallDescriptor::untagged(
                CallRequest::Increment { name: name.clone() },
            ))),
            PayloadSource::Fibonacci { n } => {
                let n = fibo_common::validate_index(*n)?;
                Ok(Payload::Fixed(CallDescriptor::untagged(
                    CallRequest::Fibonacci { n },
                )))
            }
            PayloadSource::RandomFibonacci { start, end } => {
                if start > end {
                    return Err(DispatchError::InvalidArgument(format!(
                        "fibo_start ({}) must not exceed fibo_end ({})",
                        start, end
                    )));
                }
                let start = fibo_common::validate_index(*start)?;
                let end = fibo_common::validate_index(*end)?;
                Ok(Payload::Range(start, end))
            }
        }
    }
}

/// One batch: what to send, how many times, and how.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub source: PayloadSource,
    pub iterations: i64,
    pub concurrency: Option<usize>,
    pub deadline: Option<Duration>,
}

impl BatchPlan {
    pub fn new(source: PayloadSource, iterations: i64) -> Self {
        Self {
            source,
            iterations,
            concurrency: None,
            deadline: None,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Validate the plan, returning the payload generator and call count.
    ///
    /// Nothing is sent if this fails.
    fn prepare(&self) -> Result<(Payload, usize), DispatchError> {
        if self.iterations < 0 {
            return Err(DispatchError::InvalidArgument(format!(
                "iterations must be >= 0, got {}",
                self.iterations
            )));
        }
        if self.iterations > MAX_ITERATIONS {
            return Err(DispatchError::InvalidArgument(format!(
                "iterations must be <= {}, got {}",
                MAX_ITERATIONS, self.iterations
            )));
        }
        if self.concurrency == Some(0) {
            return Err(DispatchError::InvalidArgument(
                "concurrency limit must be > 0".into(),
            ));
        }
        let payload = self.source.prepare()?;
        let requested = usize::try_from(self.iterations).map_err(|_| {
            DispatchError::InvalidArgument(format!("iterations {} too large", self.iterations))
        })?;
        Ok((payload, requested))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// Position in issue order.
    pub index: usize,
    pub server: String,
    pub value: CallValue,
    /// The `n` a random-Fibonacci call was made with.
    pub n: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultBatch {
    results: Vec<CallResult>,
}

impl ResultBatch {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CallResult> {
        self.results.iter()
    }

    pub fn into_vec(self) -> Vec<CallResult> {
        self.results
    }
}

impl IntoIterator for ResultBatch {
    type Item = CallResult;
    type IntoIter = std::vec::IntoIter<CallResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct FanOutDispatcher<T: ReplicaTransport> {
    channel: Arc<LbChannel<T>>,
    default_concurrency: usize,
    default_deadline: Option<Duration>,
}

impl<T: ReplicaTransport> FanOutDispatcher<T> {
    pub fn new(channel: Arc<LbChannel<T>>) -> Self {
        Self {
            channel,
            default_concurrency: DEFAULT_CONCURRENCY,
            default_deadline: None,
        }
    }

    /// Concurrency limit for plans that don't set one. Zero is treated as one.
    pub fn with_default_concurrency(mut self, limit: usize) -> Self {
        self.default_concurrency = limit.max(1);
        self
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn channel(&self) -> &Arc<LbChannel<T>> {
        &self.channel
    }

    /// Run a single call built from `source`.
    pub async fn call_once(&self, source: PayloadSource) -> Result<CallResult, DispatchError> {
        let mut results = self.dispatch(BatchPlan::new(source, 1)).await?.into_vec();
        results
            .pop()
            .ok_or_else(|| DispatchError::Internal("single call produced no result".into()))
    }

    /// Run a batch and collect exactly `plan.iterations` results.
    pub async fn dispatch(&self, plan: BatchPlan) -> Result<ResultBatch, DispatchError> {
        let (payload, requested) = plan.prepare()?;
        if requested == 0 {
            return Ok(ResultBatch::default());
        }

        let op = plan.source.operation();
        let concurrency = plan
            .concurrency
            .unwrap_or(self.default_concurrency)
            .min(requested);
        let timeout = plan.deadline.or(self.default_deadline);
        let expires = tokio::time::sleep_until(match timeout {
            Some(t) => Instant::now() + t,
            None => Instant::now(),
        });
        tokio::pin!(expires);

        let _timer = fibo_metrics::start_batch_timer(op.as_str());
        let started = Instant::now();

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<(usize, Option<u32>, Result<crate::rpc::Reply, CallError>)> = JoinSet::new();
        let mut slots: Vec<Option<CallResult>> = (0..requested).map(|_| None).collect();
        let mut issued = 0;
        let mut completed = 0;

        // Every issued call is joined before the loop ends: while
        // `completed < requested`, either more calls remain to be issued or
        // `issued - completed` tasks are still in the set.
        while completed < requested {
            tokio::select! {
                biased;

                _ = &mut expires, if timeout.is_some() => {
                    tasks.abort_all();
                    let timeout = timeout.unwrap_or_default();
                    tracing::warn!(
                        "{} batch timed out after {:?} with {}/{} calls done",
                        op,
                        timeout,
                        completed,
                        requested
                    );
                    return Err(DispatchError::DeadlineExceeded {
                        timeout,
                        completed,
                        requested,
                    });
                }

                Some(joined) = tasks.join_next() => {
                    let (index, tag, reply) = joined
                        .map_err(|e| DispatchError::Internal(format!("call task failed: {}", e)))?;
                    match reply {
                        Ok(reply) => {
                            slots[index] = Some(CallResult {
                                index,
                                server: reply.server_name,
                                value: reply.value,
                                n: tag,
                            });
                            completed += 1;
                        }
                        Err(e) => {
                            tasks.abort_all();
                            tracing::warn!("{} batch aborted at call {}: {}", op, index, e);
                            return Err(DispatchError::from_call(index, e));
                        }
                    }
                }

                permit = permits.clone().acquire_owned(), if issued < requested => {
                    let permit = permit
                        .map_err(|_| DispatchError::Internal("batch semaphore closed".into()))?;
                    let index = issued;
                    let descriptor = payload.draw();
                    let channel = self.channel.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let reply = channel.call(&descriptor.request).await;
                        (index, descriptor.tag, reply)
                    });
                    issued += 1;
                }
            }
        }

        let results: Vec<CallResult> = slots.into_iter().flatten().collect();
        tracing::info!(
            "dispatched {} {} call(s) (concurrency {}) in {:?}",
            requested,
            op,
            concurrency,
            started.elapsed()
        );
        Ok(ResultBatch { results })
    }
}
