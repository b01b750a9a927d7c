//! # Datarail Resilience
//!
//! Retry and circuit-breaker execution layer shared by every component that
//! talks to an unreliable dependency:
//! - Exponential backoff with seeded, injectable jitter
//! - Per-operation-key circuit breakers (closed/open/half-open)
//! - Explicit failure classification (permanent/transient/unknown)
//! - Cooperative cancellation between attempts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │        ResilientExecutor (per subsystem)         │
//! │                                                  │
//! │  operation key ──▶ breaker gate ──▶ attempt loop │
//! │                         │                │       │
//! │                  DashMap<key,      jittered      │
//! │                  CircuitBreaker>   backoff sleep │
//! └──────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod breaker;
pub mod error;
pub mod executor;
pub mod policy;

pub use breaker::{CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use error::{Classify, ErrorKind, ExecutorError};
pub use executor::ResilientExecutor;
pub use policy::RetryPolicy;

/// Default attempts per operation (total, first try included)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the second attempt (milliseconds)
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Default backoff multiplier between attempts
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default upper bound for a single backoff delay (milliseconds)
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default jitter applied to each delay (fraction of the delay)
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Default circuit breaker threshold (failures before opening)
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default circuit breaker open duration (seconds before half-open)
pub const DEFAULT_CB_OPEN_SECONDS: u64 = 60;

/// Default successes required in half-open before closing
pub const DEFAULT_CB_SUCCESS_THRESHOLD: u32 = 2;
