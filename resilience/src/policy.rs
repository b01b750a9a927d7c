//! Retry policy: exponential backoff with optional jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy, immutable per call site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (first try included)
    pub max_retries: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay per failed attempt
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Apply random jitter to each delay
    pub use_jitter: bool,
    /// Jitter spread as a fraction of the delay (0.2 = within ±20%)
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_millis(crate::DEFAULT_INITIAL_DELAY_MS),
            backoff_multiplier: crate::DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(crate::DEFAULT_MAX_DELAY_MS),
            use_jitter: true,
            jitter_fraction: crate::DEFAULT_JITTER_FRACTION,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts (tests, in-process brokers)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            use_jitter: false,
            jitter_fraction: 0.0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter:
    /// `min(max_delay, initial_delay * backoff_multiplier^(attempt-1))`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay after failed attempt `attempt`, jittered from the supplied RNG
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.use_jitter || self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter_fraction;
        let jittered = rng.gen_range((base_ms - spread)..=(base_ms + spread));
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            use_jitter: false,
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = no_jitter_policy();

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        // 400ms capped by max_delay
        assert_eq!(policy.base_delay(3), Duration::from_millis(300));
        assert_eq!(policy.base_delay(10), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = RetryPolicy {
            use_jitter: true,
            jitter_fraction: 0.5,
            max_delay: Duration::from_millis(10_000),
            ..no_jitter_policy()
        };
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1, &mut rng);
            assert!(delay >= Duration::from_millis(50), "delay {delay:?} below band");
            assert!(delay <= Duration::from_millis(150), "delay {delay:?} above band");
        }
    }

    #[test]
    fn test_seeded_jitter_is_deterministic() {
        let policy = RetryPolicy {
            use_jitter: true,
            jitter_fraction: 0.2,
            ..no_jitter_policy()
        };

        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for attempt in 1..=4 {
            assert_eq!(
                policy.delay_for_attempt(attempt, &mut a),
                policy.delay_for_attempt(attempt, &mut b)
            );
        }
    }

    #[test]
    fn test_zero_delay_policy() {
        let policy = RetryPolicy::immediate(3);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(policy.delay_for_attempt(1, &mut rng), Duration::ZERO);
    }
}
