//! HTTP handlers for the facade.
//!
//! Each route turns its query string into a [`BatchPlan`], runs it through
//! the dispatcher and renders the results as JSON. Errors come back as
//! `{"error": "..."}` with a status code matching the failure class.

use crate::AppState;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fibo_lb::dispatcher::{BatchPlan, CallResult, DispatchError, PayloadSource};
use fibo_lb::rpc::{CallError, CallValue, ReplicaTransport};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("unexpected reply from {server}: {detail}")]
    UnexpectedReply { server: String, detail: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(e) => match e {
                DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                DispatchError::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
                // The replica refused the input itself.
                DispatchError::RemoteCallFailure {
                    source: CallError::Remote { code, .. },
                    ..
                } if code == "InvalidArgument" => StatusCode::BAD_REQUEST,
                DispatchError::RemoteCallFailure { .. } => StatusCode::BAD_GATEWAY,
                DispatchError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::UnexpectedReply { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct IncrementParams {
    pub pod_name: Option<String>,
    pub iterations: Option<i64>,
    /// Older clients send the singular form.
    pub iteration: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FibonacciParams {
    pub n: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RandomFibonacciParams {
    pub iterations: Option<i64>,
    pub fibo_start: Option<i64>,
    pub fibo_end: Option<i64>,
    pub output: Option<String>,
}

impl RandomFibonacciParams {
    /// Anything but a case-insensitive `true` turns output off.
    fn wants_output(&self) -> bool {
        self.output
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case("true"))
            .unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementEntry {
    pub server: String,
    pub response: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibonacciEntry {
    pub server: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomFibonacciEntry {
    pub server: String,
    pub n: u32,
    pub value: String,
}

fn count_of(r: &CallResult) -> Result<i64, ApiError> {
    match &r.value {
        CallValue::Count(n) => Ok(*n),
        other => Err(ApiError::UnexpectedReply {
            server: r.server.clone(),
            detail: format!("expected a count, got {:?}", other),
        }),
    }
}

fn fibonacci_of(r: &CallResult) -> Result<String, ApiError> {
    match &r.value {
        CallValue::Fibonacci(v) => Ok(v.clone()),
        other => Err(ApiError::UnexpectedReply {
            server: r.server.clone(),
            detail: format!("expected a Fibonacci value, got {:?}", other),
        }),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /increment?pod_name=&iterations=`
pub async fn increment<T: ReplicaTransport>(
    State(state): State<AppState<T>>,
    params: Result<Query<IncrementParams>, QueryRejection>,
) -> Result<Json<Vec<IncrementEntry>>, ApiError> {
    let Query(params) = params?;
    let iterations = params.iterations.or(params.iteration).unwrap_or(1);
    let name = params.pod_name.unwrap_or_else(|| state.pod_name.clone());

    let plan = BatchPlan::new(PayloadSource::Increment { name }, iterations);
    let batch = state.dispatcher.dispatch(plan).await?;

    let mut entries = Vec::with_capacity(batch.len());
    for r in batch.iter() {
        let response = count_of(r)?;
        tracing::info!("Server: {} Response: {}", r.server, response);
        entries.push(IncrementEntry {
            server: r.server.clone(),
            response,
        });
    }
    Ok(Json(entries))
}

/// `GET /fibonacci?n=`
pub async fn fibonacci<T: ReplicaTransport>(
    State(state): State<AppState<T>>,
    params: Result<Query<FibonacciParams>, QueryRejection>,
) -> Result<Json<FibonacciEntry>, ApiError> {
    let Query(params) = params?;
    let n = params.n.unwrap_or(1);

    let r = state
        .dispatcher
        .call_once(PayloadSource::Fibonacci { n })
        .await?;
    let value = fibonacci_of(&r)?;
    tracing::info!("Server: {} Fibonacci Value: {}", r.server, value);
    Ok(Json(FibonacciEntry {
        server: r.server,
        value,
    }))
}

/// `GET /fibonacci/random?iterations=&fibo_start=&fibo_end=&output=`
pub async fn random_fibonacci<T: ReplicaTransport>(
    State(state): State<AppState<T>>,
    params: Result<Query<RandomFibonacciParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let plan = BatchPlan::new(
        PayloadSource::RandomFibonacci {
            start: params.fibo_start.unwrap_or(1),
            end: params.fibo_end.unwrap_or(10),
        },
        params.iterations.unwrap_or(1),
    );
    let batch = state.dispatcher.dispatch(plan).await?;

    let mut entries = Vec::with_capacity(batch.len());
    for r in batch.iter() {
        let n = r.n.ok_or_else(|| ApiError::UnexpectedReply {
            server: r.server.clone(),
            detail: "random call lost its n".into(),
        })?;
        tracing::info!("Server: {} Fibonacci Value for n={}", r.server, n);
        entries.push(RandomFibonacciEntry {
            server: r.server.clone(),
            n,
            value: fibonacci_of(r)?,
        });
    }

    if params.wants_output() {
        Ok(Json(entries).into_response())
    } else {
        Ok(Json(serde_json::json!({ "completed": entries.len() })).into_response())
    }
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
