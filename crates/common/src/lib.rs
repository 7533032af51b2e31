//! fibo-common: shared types for the fibo workspace.
//!
//! Holds the pure Fibonacci compute function used by replicas (and by tests
//! to check what replicas return), plus the `Operation` label shared by
//! server-side and client-side telemetry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest index whose Fibonacci value fits in a `u128`.
///
/// F(186) = 332825110087067562321196029789634457848; F(187) overflows.
pub const MAX_FIBONACCI_N: u32 = 186;

/// Most calls one batch may fan out.
///
/// A batch holds one result per call, so this also caps what a single
/// request can make the gateway allocate.
pub const MAX_ITERATIONS: i64 = 100_000;

// ---------------------------------------------------------------------------
// Fibonacci
// ---------------------------------------------------------------------------

/// Compute F(n) by iterative accumulation.
///
/// `n` must be at most [`MAX_FIBONACCI_N`]; use [`checked_fibonacci`] for
/// untrusted input.
pub fn fibonacci(n: u32) -> u128 {
    if n == 0 {
        return 0;
    }
    // Stop at F(n) rather than F(n + 1) so F(186) does not overflow.
    let (mut a, mut b) = (0u128, 1u128);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

/// Validate an untrusted index and compute F(n).
pub fn checked_fibonacci(n: i64) -> Result<u128, FibonacciError> {
    let index = validate_index(n)?;
    Ok(fibonacci(index))
}

/// Check that `n` is a usable Fibonacci index.
pub fn validate_index(n: i64) -> Result<u32, FibonacciError> {
    if n < 0 {
        return Err(FibonacciError::Negative(n));
    }
    match u32::try_from(n) {
        Ok(index) if index <= MAX_FIBONACCI_N => Ok(index),
        _ => Err(FibonacciError::TooLarge(n)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FibonacciError {
    #[error("fibonacci index must be >= 0, got {0}")]
    Negative(i64),

    #[error("fibonacci index {0} exceeds the maximum of {max}", max = MAX_FIBONACCI_N)]
    TooLarge(i64),
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The two RPCs a replica serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Increment,
    Fibonacci,
}

impl Operation {
    /// Label used in metrics and logs. Matches the RPC method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Increment => "Increment",
            Operation::Fibonacci => "Fibonacci",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
