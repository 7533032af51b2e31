//! The replica's increment counter under two concurrency models.
//!
//! - `Locked`: the value sits behind a mutex; any runtime worker may bump it.
//! - `Serialized`: a single task owns the value and applies requests from a
//!   channel one at a time, so no lock is involved.
//!
//! Both guarantee that N increments leave the counter at exactly N.

use crate::ReplicaError;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Queue depth for the serialized counter's request channel.
const SERIALIZED_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterModel {
    Locked,
    Serialized,
}

#[derive(Debug)]
enum CounterOp {
    Increment(oneshot::Sender<i64>),
    Get(oneshot::Sender<i64>),
    Stop(oneshot::Sender<i64>),
}

/// A replica-private counter.
#[derive(Debug)]
pub struct Counter {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Locked(Mutex<i64>),
    Serialized(mpsc::Sender<CounterOp>),
}

impl Counter {
    pub fn new(model: CounterModel) -> Self {
        let inner = match model {
            CounterModel::Locked => Inner::Locked(Mutex::new(0)),
            CounterModel::Serialized => {
                let (tx, rx) = mpsc::channel(SERIALIZED_QUEUE_DEPTH);
                tokio::spawn(run_counter(rx));
                Inner::Serialized(tx)
            }
        };
        Self { inner }
    }

    /// Add one and return the new value.
    pub async fn increment(&self) -> Result<i64, ReplicaError> {
        match &self.inner {
            Inner::Locked(value) => {
                let mut guard = value.lock().await;
                *guard += 1;
                Ok(*guard)
            }
            Inner::Serialized(tx) => request(tx, CounterOp::Increment).await,
        }
    }

    pub async fn get(&self) -> Result<i64, ReplicaError> {
        match &self.inner {
            Inner::Locked(value) => Ok(*value.lock().await),
            Inner::Serialized(tx) => request(tx, CounterOp::Get).await,
        }
    }

    /// Return the final value. A serialized counter's task exits and later
    /// requests fail with `CounterClosed`.
    pub async fn stop(&self) -> Result<i64, ReplicaError> {
        match &self.inner {
            Inner::Locked(value) => Ok(*value.lock().await),
            Inner::Serialized(tx) => request(tx, CounterOp::Stop).await,
        }
    }
}

async fn request(
    tx: &mpsc::Sender<CounterOp>,
    op: fn(oneshot::Sender<i64>) -> CounterOp,
) -> Result<i64, ReplicaError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(op(reply_tx))
        .await
        .map_err(|_| ReplicaError::CounterClosed)?;
    reply_rx.await.map_err(|_| ReplicaError::CounterClosed)
}

/// Owns the count until every sender is dropped or a `Stop` arrives.
async fn run_counter(mut rx: mpsc::Receiver<CounterOp>) {
    let mut count: i64 = 0;
    while let Some(op) = rx.recv().await {
        match op {
            CounterOp::Increment(reply) => {
                count += 1;
                // The caller may have gone away; the increment still stands.
                let _ = reply.send(count);
            }
            CounterOp::Get(reply) => {
                let _ = reply.send(count);
            }
            CounterOp::Stop(reply) => {
                let _ = reply.send(count);
                break;
            }
        }
    }
    tracing::debug!("serialized counter stopped at {}", count);
}
