//! fibo-lb: client-side replica selection and concurrent fan-out.
//!
//! - [`resolver`]: target description to replica addresses
//! - [`selector`]: which address takes the next call
//! - [`channel`]: resolver + selector + transport behind one `call`
//! - [`dispatcher`]: k calls through a channel, bounded concurrency
//!
//! The wire itself sits behind [`rpc::ReplicaTransport`], implemented over
//! gRPC in `fibo-net`.

pub mod channel;
pub mod dispatcher;
pub mod resolver;
pub mod rpc;
pub mod selector;

#[cfg(test)]
mod mock;

pub use channel::{ChannelSpec, ChannelState, LbChannel};
pub use dispatcher::{
    BatchPlan, CallResult, DispatchError, FanOutDispatcher, PayloadSource, ResultBatch,
};
pub use resolver::{DnsResolver, PassthroughResolver, Resolve, ResolveError, StaticResolver};
pub use rpc::{CallError, CallRequest, CallValue, ReplicaAddr, ReplicaTransport, Reply};
pub use selector::{RoundRobin, SelectionPolicy, Selector};
