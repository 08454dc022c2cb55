//! Engine configuration.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use weft_execution::RetryPolicy;
use weft_vm::DEFAULT_MAX_STEPS;

/// Tunables for an [`Engine`](crate::Engine) and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker tasks in the pool.
    pub workers: usize,
    /// Instructions one slice may execute before the instance is requeued.
    pub max_steps_per_slice: usize,
    /// How long a claimed job stays invisible to other executors.
    pub claim_lease_ms: u64,
    /// How long a dead-letter entry is kept before it may be purged.
    pub dead_letter_ttl_ms: u64,
    /// Delay between job attempts.
    pub retry: RetryPolicy,
    /// Commit attempts before giving up on a contended instance.
    pub commit_attempts: u32,
    /// Capacity of the run queue feeding the worker pool.
    pub queue_capacity: usize,
    /// How often the pool sweeps for runnable instances.
    pub tick_ms: u64,
    /// Let the pool's sweep fire due timers as well. Off by default: timers
    /// are driven from outside through [`Engine::fire_due_timers`] or
    /// [`Engine::signal`]. Useful for single-process embeddings and tests.
    ///
    /// [`Engine::fire_due_timers`]: crate::Engine::fire_due_timers
    /// [`Engine::signal`]: crate::Engine::signal
    pub sweep_timers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_steps_per_slice: DEFAULT_MAX_STEPS,
            claim_lease_ms: 30_000,
            dead_letter_ttl_ms: 7 * 24 * 60 * 60 * 1_000,
            retry: RetryPolicy::default(),
            commit_attempts: 5,
            queue_capacity: 1_024,
            tick_ms: 1_000,
            sweep_timers: false,
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment.
    ///
    /// Recognised: `WEFT_WORKERS`, `WEFT_CLAIM_LEASE_MS`,
    /// `WEFT_DEAD_LETTER_TTL_MS`, `WEFT_RETRY_INITIAL_MS`,
    /// `WEFT_RETRY_MAX_MS`, `WEFT_RETRY_MULTIPLIER`, `WEFT_SWEEP_TIMERS`.
    /// Unset or unparsable
    /// values keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn read<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            match lookup(key).map(|raw| raw.trim().parse::<T>()) {
                Some(Ok(value)) => *slot = value,
                Some(Err(_)) => tracing::warn!(key, "ignoring unparsable setting"),
                None => {}
            }
        }

        let mut config = Self::default();
        read(&lookup, "WEFT_WORKERS", &mut config.workers);
        read(&lookup, "WEFT_CLAIM_LEASE_MS", &mut config.claim_lease_ms);
        read(&lookup, "WEFT_DEAD_LETTER_TTL_MS", &mut config.dead_letter_ttl_ms);
        read(&lookup, "WEFT_RETRY_INITIAL_MS", &mut config.retry.initial_delay_ms);
        read(&lookup, "WEFT_RETRY_MAX_MS", &mut config.retry.max_delay_ms);
        read(&lookup, "WEFT_RETRY_MULTIPLIER", &mut config.retry.backoff_multiplier);
        read(&lookup, "WEFT_SWEEP_TIMERS", &mut config.sweep_timers);
        config.workers = config.workers.max(1);
        config
    }

    /// Set the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the retry schedule.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease_ms = lease.as_millis() as u64;
        self
    }

    /// Set the dead-letter retention.
    #[must_use]
    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Let the worker pool fire due timers on every sweep.
    #[must_use]
    pub fn with_timer_sweep(mut self, enabled: bool) -> Self {
        self.sweep_timers = enabled;
        self
    }

    /// Set the per-slice step budget.
    #[must_use]
    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps_per_slice = steps.max(1);
        self
    }

    /// Claim lease as a time delta.
    #[must_use]
    pub fn claim_lease(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.claim_lease_ms as i64)
    }

    /// Dead-letter retention as a std duration.
    #[must_use]
    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_millis(self.dead_letter_ttl_ms)
    }

    /// Sweep interval as a std duration.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("WEFT_WORKERS", "8"),
            ("WEFT_CLAIM_LEASE_MS", "500"),
            ("WEFT_RETRY_INITIAL_MS", "10"),
            ("WEFT_RETRY_MULTIPLIER", "3.0"),
            ("WEFT_SWEEP_TIMERS", "true"),
        ]));
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.claim_lease(), TimeDelta::milliseconds(500));
        assert_eq!(cfg.retry.initial_delay_ms, 10);
        assert!((cfg.retry.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert!(cfg.sweep_timers);
    }

    #[test]
    fn timer_sweep_is_off_by_default() {
        assert!(!EngineConfig::default().sweep_timers);
        assert!(EngineConfig::default().with_timer_sweep(true).sweep_timers);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("WEFT_WORKERS", "many"),
            ("WEFT_DEAD_LETTER_TTL_MS", "-1"),
        ]));
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn zero_workers_is_clamped() {
        let cfg = EngineConfig::from_lookup(lookup(&[("WEFT_WORKERS", "0")]));
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"workers": 2, "retry": {"initial_delay_ms": 5, "max_delay_ms": 50, "backoff_multiplier": 2.0}}"#)
                .unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.retry, RetryPolicy::exponential(5, 50));
        assert_eq!(cfg.commit_attempts, 5);
    }
}
