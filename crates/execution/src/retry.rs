//! Retry backoff schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between job attempts. The number of attempts is set per
/// ServiceTask; this only decides how long to wait between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a fixed-delay policy.
    #[must_use]
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Create an exponential-backoff policy (multiplier = 2.0).
    #[must_use]
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate the delay before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(1_000, 60_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fixed_policy_fields() {
        let p = RetryPolicy::fixed(500);
        assert_eq!(p.initial_delay_ms, 500);
        assert_eq!(p.max_delay_ms, 500);
        assert!((p.backoff_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(3, 800)]
    #[case(7, 10_000)]
    #[case(u32::MAX, 10_000)]
    fn exponential_backoff_caps_at_max(#[case] retry: u32, #[case] expected_ms: u64) {
        let p = RetryPolicy::exponential(100, 10_000);
        assert_eq!(p.delay_for_attempt(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn fixed_is_constant() {
        let p = RetryPolicy::fixed(250);
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(250));
    }
}
