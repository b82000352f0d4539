//! Orchestrator configuration, read from the environment with the teacher's
//! `ORCH_*`-prefixed-variable, explicit-default pattern
//! (`gator_db::config::DbConfig::from_env`).

use std::env;
use std::time::Duration;

/// Tunables for the task queue, retry/fallback caller, decision tracer, and
/// approval gate. Every field has a compile-time default; `from_env`
/// overrides only the ones with a matching environment variable set.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent workers draining the task queue.
    pub worker_count: usize,
    /// Attempts per provider before the retry/fallback caller advances to
    /// the next provider in the chain.
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter_fraction: f64,
    /// How long an unhealthy provider is skipped before being reconsidered.
    pub provider_cooldown: Duration,
    /// Confidence strictly below this requires approval.
    pub approval_confidence_threshold: f64,
    pub approval_timeout: Duration,
    /// How long the orchestrator waits for in-flight workers to finish
    /// during a graceful shutdown before giving up.
    pub drain_timeout: Duration,
}

impl OrchestratorConfig {
    pub const DEFAULT_WORKER_COUNT: usize = 2;

    /// Build a config from the environment.
    ///
    /// Recognized variables: `ORCH_WORKER_COUNT`, `ORCH_RETRY_ATTEMPTS`,
    /// `ORCH_RETRY_BASE_DELAY_MS`, `ORCH_RETRY_MAX_DELAY_MS`,
    /// `ORCH_RETRY_JITTER_FRACTION`, `ORCH_PROVIDER_COOLDOWN_SECS`,
    /// `ORCH_APPROVAL_CONFIDENCE_THRESHOLD`, `ORCH_APPROVAL_TIMEOUT_SECS`,
    /// `ORCH_DRAIN_TIMEOUT_SECS`. Unset or unparsable variables fall back to
    /// the compile-time default for that field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parsed("ORCH_WORKER_COUNT").unwrap_or(defaults.worker_count),
            retry_attempts: env_parsed("ORCH_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_base_delay: env_parsed("ORCH_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parsed("ORCH_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            retry_jitter_fraction: env_parsed("ORCH_RETRY_JITTER_FRACTION")
                .unwrap_or(defaults.retry_jitter_fraction),
            provider_cooldown: env_parsed("ORCH_PROVIDER_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider_cooldown),
            approval_confidence_threshold: env_parsed("ORCH_APPROVAL_CONFIDENCE_THRESHOLD")
                .unwrap_or(defaults.approval_confidence_threshold),
            approval_timeout: env_parsed("ORCH_APPROVAL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.approval_timeout),
            drain_timeout: env_parsed("ORCH_DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
        }
    }

    pub fn retry_config(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig {
            max_attempts_per_provider: self.retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter_fraction: self.retry_jitter_fraction,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: Self::DEFAULT_WORKER_COUNT,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter_fraction: 0.2,
            provider_cooldown: Duration::from_secs(60),
            approval_confidence_threshold: 0.7,
            approval_timeout: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.approval_confidence_threshold, 0.7);
        assert_eq!(cfg.provider_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn from_env_overrides_worker_count() {
        // SAFETY in the test-harness sense only: this test does not run
        // concurrently with others that read ORCH_WORKER_COUNT.
        unsafe {
            env::set_var("ORCH_WORKER_COUNT", "7");
        }
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.worker_count, 7);
        unsafe {
            env::remove_var("ORCH_WORKER_COUNT");
        }
    }

    #[test]
    fn from_env_falls_back_on_unset() {
        unsafe {
            env::remove_var("ORCH_APPROVAL_TIMEOUT_SECS");
        }
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.approval_timeout, Duration::from_secs(300));
    }
}
