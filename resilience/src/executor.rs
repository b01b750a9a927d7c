//! Resilient execution: retry with backoff behind a per-key circuit breaker

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::error::{Classify, ExecutorError};
use crate::policy::RetryPolicy;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry + circuit breaker executor.
///
/// One instance per subsystem; breaker state lives on the instance, keyed by
/// operation key, created on first use and kept for the process lifetime.
/// The jitter RNG is seeded at construction so retry timing is reproducible
/// under test.
pub struct ResilientExecutor {
    breakers: DashMap<String, CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    rng: Mutex<StdRng>,
}

impl ResilientExecutor {
    /// Create an executor with OS-seeded jitter
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self::with_seed(breaker_config, rand::random())
    }

    /// Create an executor with a fixed jitter seed
    pub fn with_seed(breaker_config: CircuitBreakerConfig, seed: u64) -> Self {
        Self {
            breakers: DashMap::new(),
            breaker_config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Run `operation` under `policy` and the circuit breaker for
    /// `operation_key`.
    ///
    /// Transient failures retry with jittered exponential backoff. Permanent
    /// and unclassified failures surface immediately. While the breaker is
    /// open, calls fail with [`ExecutorError::CircuitOpen`] without invoking
    /// the operation. A failure observed while half-open re-opens the
    /// breaker and aborts any remaining retries. Cancellation between
    /// attempts surfaces [`ExecutorError::Cancelled`] and leaves breaker
    /// counters untouched.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExecutorError<E>>
    where
        E: Classify + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled {
                operation_key: operation_key.to_string(),
                attempts: 0,
            });
        }

        if let Err(retry_in) = self.try_acquire(operation_key) {
            debug!(
                "Rejecting operation {} while circuit open, retry in {:?}",
                operation_key, retry_in
            );
            return Err(ExecutorError::CircuitOpen {
                operation_key: operation_key.to_string(),
                retry_in,
            });
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    self.record_success(operation_key);
                    return Ok(value);
                }
                Err(err) => {
                    // A failed half-open probe re-opens the circuit at once,
                    // remaining retries included
                    if self.current_state(operation_key) == Some(CircuitState::HalfOpen) {
                        warn!(
                            "Probe failed for operation {}, re-opening circuit: {}",
                            operation_key, err
                        );
                        self.record_failure(operation_key);
                        return Err(ExecutorError::Exhausted {
                            operation_key: operation_key.to_string(),
                            attempts,
                            source: err,
                        });
                    }

                    if !err.kind().is_retryable() || attempts >= policy.max_retries {
                        self.record_failure(operation_key);
                        return Err(ExecutorError::Exhausted {
                            operation_key: operation_key.to_string(),
                            attempts,
                            source: err,
                        });
                    }

                    let delay = self.next_delay(policy, attempts);
                    debug!(
                        "Retrying operation {} (attempt {}/{}) in {:?}: {}",
                        operation_key, attempts, policy.max_retries, delay, err
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ExecutorError::Cancelled {
                                operation_key: operation_key.to_string(),
                                attempts,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Snapshot of the breaker for an operation key, if one exists
    pub fn breaker_state(&self, operation_key: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(operation_key).map(|b| b.snapshot())
    }

    /// Manually reset the breaker for an operation key
    pub fn reset(&self, operation_key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(operation_key) {
            breaker.reset(operation_key);
        }
    }

    fn try_acquire(&self, operation_key: &str) -> Result<(), Duration> {
        let mut entry = self
            .breakers
            .entry(operation_key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        entry.value_mut().try_acquire(operation_key)
    }

    fn record_success(&self, operation_key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(operation_key) {
            breaker.record_success(operation_key);
        }
    }

    fn record_failure(&self, operation_key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(operation_key) {
            breaker.record_failure(operation_key);
        }
    }

    fn current_state(&self, operation_key: &str) -> Option<CircuitState> {
        self.breakers.get(operation_key).map(|b| b.state())
    }

    fn next_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let mut rng = self.rng.lock();
        policy.delay_for_attempt(attempt, &mut *rng)
    }
}
