//! Circuit breaker per operation key

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Closed (normal operation)
    Closed,
    /// Open (rejecting calls)
    Open,
    /// Half-open (probing)
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure threshold (open after N recorded failures)
    pub failure_threshold: u32,
    /// How long the circuit stays open before the next call probes
    pub open_duration: Duration,
    /// Successes required in half-open before closing
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            open_duration: Duration::from_secs(crate::DEFAULT_CB_OPEN_SECONDS),
            success_threshold: crate::DEFAULT_CB_SUCCESS_THRESHOLD,
        }
    }
}

/// Point-in-time view of a breaker, for operator surfaces
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Recorded failures (decays on closed-state successes)
    pub failure_count: u32,
    /// Successes recorded while half-open
    pub success_count: u32,
    /// When the open window ends, if currently open
    pub open_until: Option<DateTime<Utc>>,
}

/// Circuit breaker for a single operation key
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<DateTime<Utc>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create new circuit breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            open_until: None,
            config,
        }
    }

    /// Check whether a call may proceed.
    ///
    /// While open, `Err` carries the time remaining until the circuit
    /// half-opens. The open-to-half-open transition happens lazily here,
    /// on the first call after `open_until` passes.
    pub fn try_acquire(&mut self, operation_key: &str) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Utc::now();
                match self.open_until {
                    Some(until) if now < until => {
                        Err((until - now).to_std().unwrap_or_default())
                    }
                    _ => {
                        info!("Circuit half-opening for operation {}", operation_key);
                        self.state = CircuitState::HalfOpen;
                        self.success_count = 0;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self, operation_key: &str) {
        match self.state {
            CircuitState::Closed => {
                // Decay toward zero rather than reset
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    info!(
                        "Circuit closing for operation {} after {} probe successes",
                        operation_key, self.success_count
                    );
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.open_until = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, operation_key: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit opening for operation {} after {} failures",
                        operation_key, self.failure_count
                    );
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure re-opens, threshold not consulted
                warn!("Circuit re-opening for operation {}", operation_key);
                self.failure_count += 1;
                self.trip();
            }
            CircuitState::Open => {}
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            open_until: self.open_until,
        }
    }

    /// Reset to closed (manual intervention)
    pub fn reset(&mut self, operation_key: &str) {
        info!("Manually resetting circuit for operation {}", operation_key);
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.open_until = None;
    }

    fn trip(&mut self) {
        let open_for = chrono::Duration::from_std(self.config.open_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(crate::DEFAULT_CB_OPEN_SECONDS as i64));
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.open_until = Some(Utc::now() + open_for);
    }
}
