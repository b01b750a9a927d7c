//! Failure classification and executor errors

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure class, attached at the point an error is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Will not succeed on retry (bad input, rejected payload, missing entity)
    Permanent,
    /// May succeed on retry (connectivity, timeout, throttling)
    Transient,
    /// Unclassified; treated like permanent and never retried
    Unknown,
}

impl ErrorKind {
    /// Whether the executor may retry a failure of this class
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Classification seam for errors run through the executor.
///
/// Implemented by the error type of each dependency call site, so the
/// executor never inspects concrete error types.
pub trait Classify {
    /// Failure class of this error
    fn kind(&self) -> ErrorKind;
}

/// Errors surfaced by [`crate::ResilientExecutor::execute`]
#[derive(Error, Debug)]
pub enum ExecutorError<E>
where
    E: std::error::Error + 'static,
{
    /// Circuit open for the operation key; the operation was not invoked
    #[error("Circuit open for operation {operation_key}, retry in {retry_in:?}")]
    CircuitOpen {
        /// Operation key
        operation_key: String,
        /// Time remaining until the breaker half-opens
        retry_in: Duration,
    },

    /// Cancelled before or between attempts
    #[error("Operation {operation_key} cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Operation key
        operation_key: String,
        /// Attempts made before cancellation
        attempts: u32,
    },

    /// Attempts exhausted, or the failure was not retryable
    #[error("Operation {operation_key} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Operation key
        operation_key: String,
        /// Attempts made
        attempts: u32,
        /// Final error
        #[source]
        source: E,
    },
}

impl<E> ExecutorError<E>
where
    E: std::error::Error + 'static,
{
    /// Operation key the failure belongs to
    pub fn operation_key(&self) -> &str {
        match self {
            ExecutorError::CircuitOpen { operation_key, .. } => operation_key,
            ExecutorError::Cancelled { operation_key, .. } => operation_key,
            ExecutorError::Exhausted { operation_key, .. } => operation_key,
        }
    }

    /// Final underlying error, if any attempt was made
    pub fn into_source(self) -> Option<E> {
        match self {
            ExecutorError::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}
