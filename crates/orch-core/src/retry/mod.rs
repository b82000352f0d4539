//! Retry/fallback caller (spec §4.2): call one provider with bounded
//! retries and exponential backoff, and on terminal failure advance to the
//! next provider in the fallback chain the routing policy computed at
//! call-start.
//!
//! The retry-then-fallback shape and the transient/terminal split are
//! grounded in the wider LLM-gateway corpus's retry wrappers (e.g. a
//! `RetryPolicy<P>` that retries transient errors with backoff before
//! giving up, and a `FallbackChain` that walks an ordered provider list
//! once retries on the current one are exhausted).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::model::{ProviderId, ProviderResponse, Usage};
use crate::ports::provider::{ProviderCallError, ProviderPort};
use crate::routing::{RoutingPolicy, RoutingRequest};

/// Bounded-retry, bounded-fallback configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per provider before advancing to the next one in the chain.
    pub max_attempts_per_provider: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, `0.0..=1.0`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_provider: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

/// Computes `base * 2^(attempt_index - 1)` (1-based `attempt_index`),
/// capped at `max_delay`, plus up to `jitter_fraction` of that value as
/// random jitter.
pub fn backoff_delay(config: &RetryConfig, attempt_index: u32) -> Duration {
    let exp = attempt_index.saturating_sub(1).min(20);
    let raw_ms = config
        .base_delay
        .as_millis()
        .saturating_mul(1u128 << exp.min(32));
    let capped_ms = raw_ms.min(config.max_delay.as_millis());
    let jitter_max_ms = (capped_ms as f64 * config.jitter_fraction) as u64;
    let jitter_ms = if jitter_max_ms > 0 {
        rand::rng().random_range(0..=jitter_max_ms)
    } else {
        0
    };
    Duration::from_millis(capped_ms as u64 + jitter_ms)
}

/// One attempt's outcome, reported to a [`RetryObserver`] so the caller can
/// trace it and emit a `log` event (spec §4.5 step 6) without this module
/// knowing anything about decision tracing or the event hub.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub attempt_index: u32,
    pub provider: ProviderId,
    pub error_message: String,
    /// `Some(p)` when this failure exhausted retries (or was terminal) and
    /// the caller is advancing to provider `p`; `None` for a same-provider
    /// retry.
    pub next_provider: Option<ProviderId>,
}

/// Notified once per failed attempt, before the retry/fallback sleep.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_attempt(&self, event: AttemptEvent);
}

/// A no-op observer for callers that don't need attempt-level hooks.
pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn on_attempt(&self, _event: AttemptEvent) {}
}

/// Call `primary`, retrying transient failures up to
/// `config.max_attempts_per_provider` times, then falling back through the
/// chain the routing policy computes once at call-start.
///
/// Every attempt — success or failure — updates `policy` via
/// [`RoutingPolicy::on_result`]. Providers are tried in the order computed
/// up front; a concurrent `on_result` from another in-flight call cannot
/// reorder this call's in-flight chain (spec §4.2 ordering guarantee).
pub async fn call_with_retry(
    policy: &RoutingPolicy,
    provider_port: &dyn ProviderPort,
    primary: ProviderId,
    request: &RoutingRequest,
    model: &str,
    credential: Option<&str>,
    config: &RetryConfig,
    observer: &dyn RetryObserver,
) -> ProviderResponse {
    let fallback_chain = policy.fallback_chain(primary, request);
    let mut chain = std::iter::once(primary).chain(fallback_chain);

    let mut provider = match chain.next() {
        Some(p) => p,
        None => {
            return ProviderResponse {
                success: false,
                content: None,
                used_provider: None,
                attempts: 0,
                usage: None,
                error: Some("no providers available".to_string()),
            };
        }
    };

    let mut total_attempts: u32 = 0;
    let mut last_error = String::new();

    loop {
        let mut attempt_index: u32 = 0;
        loop {
            attempt_index += 1;
            total_attempts += 1;

            let result = provider_port
                .call(
                    provider,
                    &request.prompt,
                    model,
                    credential,
                    request.max_output_tokens,
                )
                .await;

            match result {
                Ok(outcome) => {
                    policy.on_result(provider, true, None);
                    return ProviderResponse {
                        success: true,
                        content: Some(outcome.content),
                        used_provider: Some(provider),
                        attempts: total_attempts,
                        usage: Some(Usage {
                            input_tokens: outcome.usage.input_tokens,
                            output_tokens: outcome.usage.output_tokens,
                            cost_estimate: outcome.usage.cost_estimate,
                        }),
                        error: None,
                    };
                }
                Err(err) => {
                    policy.on_result(provider, false, Some(err.message()));
                    last_error = err.message().to_string();

                    let transient = matches!(err, ProviderCallError::Transient { .. });
                    let exhausted = attempt_index >= config.max_attempts_per_provider;

                    if transient && !exhausted {
                        observer
                            .on_attempt(AttemptEvent {
                                attempt_index,
                                provider,
                                error_message: last_error.clone(),
                                next_provider: None,
                            })
                            .await;
                        tokio::time::sleep(backoff_delay(config, attempt_index)).await;
                        continue;
                    }

                    // Terminal failure, or retries exhausted: advance.
                    let next = chain.next();
                    observer
                        .on_attempt(AttemptEvent {
                            attempt_index,
                            provider,
                            error_message: last_error.clone(),
                            next_provider: next,
                        })
                        .await;

                    match next {
                        Some(next_provider) => {
                            provider = next_provider;
                            break;
                        }
                        None => {
                            return ProviderResponse {
                                success: false,
                                content: None,
                                used_provider: None,
                                attempts: total_attempts,
                                usage: None,
                                error: Some(last_error),
                            };
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::provider::ProviderCallOutcome;
    use crate::routing::{Capabilities, CostRates, ProviderState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn policy_with(providers: &[(ProviderId, u32)]) -> RoutingPolicy {
        RoutingPolicy::new(providers.iter().map(|(id, prio)| {
            ProviderState::new(
                *id,
                *prio,
                Capabilities::default(),
                CostRates {
                    input_per_1k: 0.0,
                    output_per_1k: 0.0,
                },
            )
        }))
    }

    fn request() -> RoutingRequest {
        RoutingRequest {
            prompt: "hello".into(),
            requires_vision: false,
            requires_tools: false,
            requires_json_mode: false,
            requires_streaming: false,
            max_output_tokens: 64,
            budget_remaining: None,
        }
    }

    struct ScriptedProvider {
        /// Queued results per provider, consumed in order.
        scripts: Mutex<std::collections::HashMap<ProviderId, Vec<Result<ProviderCallOutcome, ProviderCallError>>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderPort for ScriptedProvider {
        async fn call(
            &self,
            provider: ProviderId,
            _prompt: &str,
            _model: &str,
            _credential: Option<&str>,
            _max_output_tokens: u32,
        ) -> Result<ProviderCallOutcome, ProviderCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(&provider).expect("unscripted provider called");
            assert!(!queue.is_empty(), "provider {provider} called more times than scripted");
            queue.remove(0)
        }
    }

    fn outcome(content: &str) -> Result<ProviderCallOutcome, ProviderCallError> {
        Ok(ProviderCallOutcome {
            content: content.to_string(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cost_estimate: "0.0001".into(),
            },
        })
    }

    fn transient(msg: &str) -> Result<ProviderCallOutcome, ProviderCallError> {
        Err(ProviderCallError::Transient { message: msg.into() })
    }

    fn terminal(msg: &str) -> Result<ProviderCallOutcome, ProviderCallError> {
        Err(ProviderCallError::Terminal {
            message: msg.into(),
            reason: crate::ports::provider::TerminalReason::AuthFailed,
        })
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = policy_with(&[(ProviderId::OpenAi, 0)]);
        let provider = ScriptedProvider {
            scripts: Mutex::new([(ProviderId::OpenAi, vec![outcome("hi")])].into()),
            calls: AtomicU32::new(0),
        };
        let config = RetryConfig::default();
        let resp = call_with_retry(
            &policy,
            &provider,
            ProviderId::OpenAi,
            &request(),
            "gpt-4o",
            None,
            &config,
            &NoopObserver,
        )
        .await;

        assert!(resp.success);
        assert_eq!(resp.used_provider, Some(ProviderId::OpenAi));
        assert_eq!(resp.attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let policy = policy_with(&[(ProviderId::OpenAi, 0)]);
        let provider = ScriptedProvider {
            scripts: Mutex::new(
                [(
                    ProviderId::OpenAi,
                    vec![transient("rate limited"), outcome("hi")],
                )]
                .into(),
            ),
            calls: AtomicU32::new(0),
        };
        let mut config = RetryConfig::default();
        config.base_delay = Duration::from_millis(1);
        config.max_delay = Duration::from_millis(2);

        let resp = call_with_retry(
            &policy,
            &provider,
            ProviderId::OpenAi,
            &request(),
            "gpt-4o",
            None,
            &config,
            &NoopObserver,
        )
        .await;

        assert!(resp.success);
        assert_eq!(resp.attempts, 2);
        assert_eq!(resp.used_provider, Some(ProviderId::OpenAi));
    }

    #[tokio::test]
    async fn terminal_failure_falls_back_immediately() {
        let policy = policy_with(&[(ProviderId::OpenAi, 0), (ProviderId::Anthropic, 1)]);
        let provider = ScriptedProvider {
            scripts: Mutex::new(
                [
                    (ProviderId::OpenAi, vec![terminal("auth failed")]),
                    (ProviderId::Anthropic, vec![outcome("hi")]),
                ]
                .into(),
            ),
            calls: AtomicU32::new(0),
        };
        let resp = call_with_retry(
            &policy,
            &provider,
            ProviderId::OpenAi,
            &request(),
            "gpt-4o",
            None,
            &RetryConfig::default(),
            &NoopObserver,
        )
        .await;

        assert!(resp.success);
        assert_eq!(resp.used_provider, Some(ProviderId::Anthropic));
        assert_eq!(resp.attempts, 2);
    }

    #[tokio::test]
    async fn all_providers_exhausted_returns_failure() {
        let policy = policy_with(&[(ProviderId::OpenAi, 0), (ProviderId::Anthropic, 1)]);
        let provider = ScriptedProvider {
            scripts: Mutex::new(
                [
                    (ProviderId::OpenAi, vec![terminal("auth failed")]),
                    (ProviderId::Anthropic, vec![terminal("auth failed")]),
                ]
                .into(),
            ),
            calls: AtomicU32::new(0),
        };
        let resp = call_with_retry(
            &policy,
            &provider,
            ProviderId::OpenAi,
            &request(),
            "gpt-4o",
            None,
            &RetryConfig::default(),
            &NoopObserver,
        )
        .await;

        assert!(!resp.success);
        assert_eq!(resp.attempts, 2);
        assert!(resp.error.is_some());
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let config = RetryConfig {
            max_attempts_per_provider: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_fraction: 0.0,
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        // 8th doubling would be 800ms, capped to 500ms.
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(500));
    }
}
