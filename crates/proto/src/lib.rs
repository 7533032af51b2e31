//! Generated gRPC code for the fibo protobuf definitions.

/// Fibonacci service (Increment, Fibonacci).
pub mod fibonacci {
    tonic::include_proto!("fibo.v1");
}
