//! Routing policy (spec §4.1): tracks per-provider health and cost, picks
//! a primary provider for a request, and computes its fallback chain.
//!
//! Grounded in the same shape as the teacher's `HarnessRegistry` (a
//! collection keyed by identity, read by the orchestrator on every
//! dispatch) but adds health/cost state and filtering, which the teacher's
//! registry does not need because it only ever has one harness per name.
//! The health-decay rules mirror the provider fallback trackers seen across
//! the wider LLM-gateway corpus (consecutive-failure counters with a
//! cooldown window before a provider is retried).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::ProviderId;

/// How long a provider marked unhealthy is skipped before routing will
/// consider it available again.
pub const COOLDOWN: Duration = Duration::from_secs(60);

/// Consecutive failures after which a provider is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// How long after the last error before the error count decays by one on
/// the next success.
const ERROR_DECAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// What a provider can do and how much it costs, independent of its
/// current health.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub max_context_tokens: u32,
    pub supports_vision: bool,
    pub supports_tools: bool,
    pub supports_json_mode: bool,
    pub supports_streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_context_tokens: 128_000,
            supports_vision: false,
            supports_tools: true,
            supports_json_mode: true,
            supports_streaming: true,
        }
    }
}

/// Per-million-token... no: per-thousand-token cost rates, matching the
/// cost formula in spec §4.1.
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Mutable, in-memory health/cost record for one provider. Owned
/// exclusively by [`RoutingPolicy`].
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: ProviderId,
    /// Lower sorts first.
    pub priority: u32,
    pub enabled: bool,
    pub healthy: bool,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub last_error_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    pub capabilities: Capabilities,
    pub cost_per_token: CostRates,
}

impl ProviderState {
    pub fn new(id: ProviderId, priority: u32, capabilities: Capabilities, cost: CostRates) -> Self {
        Self {
            id,
            priority,
            enabled: true,
            healthy: true,
            error_count: 0,
            consecutive_failures: 0,
            last_error_time: None,
            last_success_time: None,
            capabilities,
            cost_per_token: cost,
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        self.healthy
            || self
                .last_error_time
                .is_some_and(|t| now.saturating_duration_since(t) >= COOLDOWN)
    }
}

/// What a request needs from a provider, used to filter and cost candidates.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub prompt: String,
    pub requires_vision: bool,
    pub requires_tools: bool,
    pub requires_json_mode: bool,
    pub requires_streaming: bool,
    pub max_output_tokens: u32,
    /// `None` means "no budget constraint".
    pub budget_remaining: Option<f64>,
}

/// Estimate input tokens for a prompt: `ceil(len(prompt) / 4)`.
///
/// An empty prompt estimates to zero tokens, which spec §8 calls out as a
/// valid (not erroneous) boundary case.
pub fn estimate_tokens(prompt: &str) -> u32 {
    let len = prompt.len() as u32;
    len.div_ceil(4)
}

/// Estimate the dollar cost of a call: input tokens at `input_per_1k`, plus
/// `max_output_tokens` at `output_per_1k` (the worst case, since actual
/// output length is unknown before the call).
pub fn estimate_cost(rates: CostRates, prompt: &str, max_output_tokens: u32) -> f64 {
    let input_tokens = estimate_tokens(prompt);
    (input_tokens as f64 / 1000.0) * rates.input_per_1k
        + (max_output_tokens as f64 / 1000.0) * rates.output_per_1k
}

fn meets_capabilities(caps: &Capabilities, req: &RoutingRequest) -> bool {
    (!req.requires_vision || caps.supports_vision)
        && (!req.requires_tools || caps.supports_tools)
        && (!req.requires_json_mode || caps.supports_json_mode)
        && (!req.requires_streaming || caps.supports_streaming)
        && estimate_tokens(&req.prompt) <= caps.max_context_tokens
}

/// Per-provider health and cost tracking, plus primary/fallback selection.
///
/// State updates and snapshots never suspend: every public method takes
/// the internal lock, does plain arithmetic, and releases it (spec §5:
/// "No suspension inside Routing Policy state updates").
pub struct RoutingPolicy {
    providers: Mutex<HashMap<ProviderId, ProviderState>>,
}

impl RoutingPolicy {
    pub fn new(providers: impl IntoIterator<Item = ProviderState>) -> Self {
        let map = providers.into_iter().map(|p| (p.id, p)).collect();
        Self {
            providers: Mutex::new(map),
        }
    }

    /// Take a point-in-time, cloned snapshot of a single provider's state.
    pub fn snapshot(&self, provider: ProviderId) -> Option<ProviderState> {
        self.providers.lock().unwrap().get(&provider).cloned()
    }

    /// Take a point-in-time, cloned snapshot of every tracked provider.
    pub fn snapshot_all(&self) -> Vec<ProviderState> {
        self.providers.lock().unwrap().values().cloned().collect()
    }

    fn eligible_sorted(
        &self,
        request: &RoutingRequest,
        exclude: Option<ProviderId>,
        enabled_providers: Option<&[ProviderId]>,
        now: Instant,
    ) -> Vec<ProviderId> {
        let guard = self.providers.lock().unwrap();
        let mut candidates: Vec<&ProviderState> = guard
            .values()
            .filter(|p| Some(p.id) != exclude)
            .filter(|p| p.enabled)
            .filter(|p| p.is_available(now))
            .filter(|p| meets_capabilities(&p.capabilities, request))
            .filter(|p| {
                enabled_providers.is_none_or(|allowed| allowed.contains(&p.id))
            })
            .filter(|p| {
                request.budget_remaining.is_none_or(|budget| {
                    estimate_cost(p.cost_per_token, &request.prompt, request.max_output_tokens)
                        <= budget
                })
            })
            .collect();
        candidates.sort_by_key(|p| p.priority);
        candidates.into_iter().map(|p| p.id).collect()
    }

    /// Pick the best provider for `request`: filter by enabled/available/
    /// capable/affordable, sort by ascending priority, return the first.
    pub fn pick(
        &self,
        request: &RoutingRequest,
        enabled_providers: Option<&[ProviderId]>,
    ) -> Option<ProviderId> {
        self.eligible_sorted(request, None, enabled_providers, Instant::now())
            .into_iter()
            .next()
    }

    /// Compute the ordered fallback chain for `request`, excluding
    /// `primary`, sorted by ascending priority.
    pub fn fallback_chain(&self, primary: ProviderId, request: &RoutingRequest) -> Vec<ProviderId> {
        self.eligible_sorted(request, Some(primary), None, Instant::now())
    }

    /// Record the outcome of a call attempt against `provider`.
    pub fn on_result(&self, provider: ProviderId, success: bool, _error: Option<&str>) {
        let now = Instant::now();
        let mut guard = self.providers.lock().unwrap();
        let Some(state) = guard.get_mut(&provider) else {
            return;
        };

        if success {
            state.healthy = true;
            state.consecutive_failures = 0;
            state.last_success_time = Some(now);
            let decay_eligible = state
                .last_error_time
                .is_some_and(|t| now.saturating_duration_since(t) >= ERROR_DECAY_WINDOW);
            if decay_eligible && state.error_count > 0 {
                state.error_count -= 1;
            }
        } else {
            state.error_count += 1;
            state.consecutive_failures += 1;
            state.last_error_time = Some(now);
            if state.consecutive_failures >= UNHEALTHY_THRESHOLD {
                state.healthy = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: ProviderId, priority: u32) -> ProviderState {
        ProviderState::new(
            id,
            priority,
            Capabilities::default(),
            CostRates {
                input_per_1k: 0.005,
                output_per_1k: 0.015,
            },
        )
    }

    fn request() -> RoutingRequest {
        RoutingRequest {
            prompt: "summarize X".into(),
            requires_vision: false,
            requires_tools: false,
            requires_json_mode: false,
            requires_streaming: false,
            max_output_tokens: 512,
            budget_remaining: None,
        }
    }

    #[test]
    fn pick_returns_lowest_priority_enabled_provider() {
        let policy = RoutingPolicy::new([
            provider(ProviderId::Anthropic, 1),
            provider(ProviderId::OpenAi, 0),
        ]);
        assert_eq!(policy.pick(&request(), None), Some(ProviderId::OpenAi));
    }

    #[test]
    fn pick_skips_disabled_provider() {
        let policy = RoutingPolicy::new([
            provider(ProviderId::OpenAi, 0),
            provider(ProviderId::Anthropic, 1),
        ]);
        {
            let mut guard = policy.providers.lock().unwrap();
            guard.get_mut(&ProviderId::OpenAi).unwrap().enabled = false;
        }
        assert_eq!(policy.pick(&request(), None), Some(ProviderId::Anthropic));
    }

    #[test]
    fn fallback_chain_excludes_primary_and_sorts_by_priority() {
        let policy = RoutingPolicy::new([
            provider(ProviderId::OpenAi, 0),
            provider(ProviderId::Groq, 2),
            provider(ProviderId::Anthropic, 1),
        ]);
        let chain = policy.fallback_chain(ProviderId::OpenAi, &request());
        assert_eq!(chain, vec![ProviderId::Anthropic, ProviderId::Groq]);
    }

    #[test]
    fn three_consecutive_failures_marks_unhealthy() {
        let policy = RoutingPolicy::new([provider(ProviderId::OpenAi, 0)]);
        for _ in 0..3 {
            policy.on_result(ProviderId::OpenAi, false, Some("boom"));
        }
        let snap = policy.snapshot(ProviderId::OpenAi).unwrap();
        assert!(!snap.healthy);
        assert_eq!(snap.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_health_and_consecutive_failures() {
        let policy = RoutingPolicy::new([provider(ProviderId::OpenAi, 0)]);
        for _ in 0..3 {
            policy.on_result(ProviderId::OpenAi, false, Some("boom"));
        }
        policy.on_result(ProviderId::OpenAi, true, None);
        let snap = policy.snapshot(ProviderId::OpenAi).unwrap();
        assert!(snap.healthy);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn unhealthy_provider_unavailable_until_cooldown() {
        let policy = RoutingPolicy::new([provider(ProviderId::OpenAi, 0)]);
        for _ in 0..3 {
            policy.on_result(ProviderId::OpenAi, false, Some("boom"));
        }
        // Cooldown has not elapsed: provider should not be picked.
        assert_eq!(policy.pick(&request(), None), None);
    }

    #[test]
    fn capability_mismatch_excludes_provider() {
        let mut caps = Capabilities::default();
        caps.max_context_tokens = 1;
        let policy = RoutingPolicy::new([ProviderState::new(
            ProviderId::OpenAi,
            0,
            caps,
            CostRates {
                input_per_1k: 0.0,
                output_per_1k: 0.0,
            },
        )]);
        assert_eq!(policy.pick(&request(), None), None);
    }

    #[test]
    fn empty_prompt_is_a_valid_zero_token_request() {
        let mut req = request();
        req.prompt = String::new();
        assert_eq!(estimate_tokens(&req.prompt), 0);
        let policy = RoutingPolicy::new([provider(ProviderId::OpenAi, 0)]);
        assert_eq!(policy.pick(&req, None), Some(ProviderId::OpenAi));
    }

    #[test]
    fn enabled_providers_filter_restricts_candidates() {
        let policy = RoutingPolicy::new([
            provider(ProviderId::OpenAi, 0),
            provider(ProviderId::Anthropic, 1),
        ]);
        let allowed = [ProviderId::Anthropic];
        assert_eq!(
            policy.pick(&request(), Some(&allowed)),
            Some(ProviderId::Anthropic)
        );
    }

    #[test]
    fn budget_filter_excludes_providers_over_budget() {
        let policy = RoutingPolicy::new([provider(ProviderId::OpenAi, 0)]);
        let mut req = request();
        req.budget_remaining = Some(0.0);
        assert_eq!(policy.pick(&req, None), None);
    }
}
