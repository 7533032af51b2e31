//! Conversions between proto messages, domain types and gRPC status codes.

use fibo_lb::rpc::{CallError, CallValue, ReplicaAddr, Reply};
use fibo_proto::fibonacci as pb;
use fibo_replica::ReplicaError;
use tonic::{Code, Status};

pub fn status_from_replica_error(e: ReplicaError) -> Status {
    match &e {
        ReplicaError::InvalidArgument(inner) => Status::invalid_argument(inner.to_string()),
        ReplicaError::CounterClosed => Status::unavailable(e.to_string()),
        ReplicaError::Worker(_) => Status::internal(e.to_string()),
    }
}

/// Classify a failed call: codes meaning "never got there" become
/// `Unreachable`, everything else is the replica's own answer.
pub fn call_error_from_status(addr: &ReplicaAddr, status: Status) -> CallError {
    if status.code() == Code::Unavailable || is_transport_failure(&status) {
        return CallError::Unreachable {
            addr: addr.clone(),
            reason: status.message().to_string(),
        };
    }
    CallError::Remote {
        addr: addr.clone(),
        code: format!("{:?}", status.code()),
        message: status.message().to_string(),
    }
}

// tonic reports connection-level failures as `Unknown` with a transport
// error as the source.
fn is_transport_failure(status: &Status) -> bool {
    std::error::Error::source(status)
        .map(|src| src.is::<tonic::transport::Error>())
        .unwrap_or(false)
}

pub fn increment_request(name: &str) -> pb::IncrementRequest {
    pb::IncrementRequest {
        name: name.to_string(),
    }
}

pub fn fibonacci_request(n: u32) -> pb::FibonacciRequest {
    pb::FibonacciRequest { n: i64::from(n) }
}

pub fn reply_from_increment(resp: pb::IncrementResponse) -> Reply {
    Reply {
        server_name: resp.server_name,
        value: CallValue::Count(resp.number),
    }
}

/// The value travels as a decimal string; reject anything else.
pub fn reply_from_fibonacci(
    addr: &ReplicaAddr,
    resp: pb::FibonacciResponse,
) -> Result<Reply, CallError> {
    if resp.value.is_empty() || !resp.value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CallError::MalformedReply {
            addr: addr.clone(),
            reason: format!("fibonacci value {:?} is not a decimal integer", resp.value),
        });
    }
    Ok(Reply {
        server_name: resp.server_name,
        value: CallValue::Fibonacci(resp.value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibo_common::FibonacciError;

    #[test]
    fn test_replica_errors_map_to_codes() {
        let s = status_from_replica_error(ReplicaError::InvalidArgument(
            FibonacciError::Negative(-1),
        ));
        assert_eq!(s.code(), Code::InvalidArgument);
        assert_eq!(
            status_from_replica_error(ReplicaError::Worker("panic".into())).code(),
            Code::Internal
        );
        assert_eq!(
            status_from_replica_error(ReplicaError::CounterClosed).code(),
            Code::Unavailable
        );
    }

    #[test]
    fn test_status_classification() {
        let addr = ReplicaAddr::new("r:1");
        let err = call_error_from_status(&addr, Status::unavailable("connection refused"));
        assert!(err.is_connectivity());

        let err = call_error_from_status(&addr, Status::invalid_argument("n < 0"));
        match err {
            CallError::Remote { code, message, .. } => {
                assert_eq!(code, "InvalidArgument");
                assert_eq!(message, "n < 0");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!call_error_from_status(&addr, Status::unknown("odd")).is_connectivity());
    }

    #[test]
    fn test_fibonacci_reply_must_be_decimal() {
        let addr = ReplicaAddr::new("r:1");
        let ok = reply_from_fibonacci(
            &addr,
            pb::FibonacciResponse {
                value: "55".into(),
                server_name: "r".into(),
            },
        )
        .unwrap();
        assert_eq!(ok.value, CallValue::Fibonacci("55".into()));

        for bad in ["", "-5", "5e3", "NaN"] {
            let err = reply_from_fibonacci(
                &addr,
                pb::FibonacciResponse {
                    value: bad.into(),
                    server_name: "r".into(),
                },
            )
            .unwrap_err();
            assert!(matches!(err, CallError::MalformedReply { .. }));
        }
    }
}
