//! The provider-call port: the single seam between the core and whatever
//! HTTP client actually talks to OpenAI, Anthropic, and friends.
//!
//! Modeled as an `async_trait`, object-safe adapter interface — directly
//! grounded in the teacher's `Harness` trait
//! (`gator-core::harness::trait_def`), which plays the same role for
//! spawning coding-agent subprocesses. A caller that wants to interpose
//! encryption, request signing, or a mock wraps this trait transparently;
//! per spec §9 the core treats it as opaque.

use async_trait::async_trait;

use crate::model::{ProviderId, Usage};

/// Why a provider call failed.
///
/// The split between `Transient` and `Terminal` is the single piece of
/// information [`crate::retry::call_with_retry`] needs to decide whether to
/// retry the same provider or advance the fallback chain.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderCallError {
    /// Retryable at the same provider (rate limiting, a transient 5xx, a
    /// network blip).
    #[error("transient provider error: {message}")]
    Transient { message: String },
    /// Not retryable at the same provider; the caller must advance to the
    /// next provider in the fallback chain.
    #[error("terminal provider error ({reason:?}): {message}")]
    Terminal {
        message: String,
        reason: TerminalReason,
    },
}

impl ProviderCallError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } => message,
            Self::Terminal { message, .. } => message,
        }
    }
}

/// The specific reason a provider call is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    AuthFailed,
    QuotaExhausted,
    UnsupportedModel,
    /// The provider explicitly signalled "do not retry" without matching
    /// one of the other named reasons.
    NonRetryable,
}

/// A successful provider call result.
#[derive(Debug, Clone)]
pub struct ProviderCallOutcome {
    pub content: String,
    pub usage: Usage,
}

/// Adapter interface for calling a single external model provider.
///
/// Implementors own the HTTP client, auth header construction, and
/// response parsing for one or more providers, and translate whatever
/// error the underlying SDK/HTTP client returns into a
/// [`ProviderCallError`] variant.
#[async_trait]
pub trait ProviderPort: Send + Sync {
    /// Call `provider` with `prompt` against `model`, optionally
    /// authenticating with `credential`. A `None` credential is not an
    /// error — the port may accept an unauthenticated call (spec §7,
    /// `CredentialMissing`).
    async fn call(
        &self,
        provider: ProviderId,
        prompt: &str,
        model: &str,
        credential: Option<&str>,
        max_output_tokens: u32,
    ) -> Result<ProviderCallOutcome, ProviderCallError>;
}
