//! gRPC service implementation.
//!
//! Bridges the tonic-generated `FibonacciService` trait to a [`Replica`].

use crate::convert;
use fibo_proto::fibonacci as pb;
use fibo_replica::Replica;
use std::sync::Arc;

pub struct FibonacciServiceImpl {
    pub replica: Arc<Replica>,
}

impl std::fmt::Debug for FibonacciServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FibonacciServiceImpl")
            .field("server_name", &self.replica.identity().server_name)
            .finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl pb::fibonacci_service_server::FibonacciService for FibonacciServiceImpl {
    async fn increment(
        &self,
        request: tonic::Request<pb::IncrementRequest>,
    ) -> Result<tonic::Response<pb::IncrementResponse>, tonic::Status> {
        let req = request.into_inner();
        let out = self
            .replica
            .increment(&req.name)
            .await
            .map_err(convert::status_from_replica_error)?;

        Ok(tonic::Response::new(pb::IncrementResponse {
            number: out.number,
            server_name: out.server_name,
        }))
    }

    async fn fibonacci(
        &self,
        request: tonic::Request<pb::FibonacciRequest>,
    ) -> Result<tonic::Response<pb::FibonacciResponse>, tonic::Status> {
        let req = request.into_inner();
        let out = self
            .replica
            .fibonacci(req.n)
            .await
            .map_err(convert::status_from_replica_error)?;

        Ok(tonic::Response::new(pb::FibonacciResponse {
            value: out.value.to_string(),
            server_name: out.server_name,
        }))
    }
}
