//! Core data types shared across the orchestration core: [`Task`], [`Run`],
//! [`DecisionTrace`], provider identity, and the small enums that describe
//! their lifecycle states.
//!
//! Enums follow the same `Display`/`FromStr` pairing used throughout the
//! storage layer so that a port implementation can round-trip them through
//! a text column or a JSON field without a separate mapping table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Provider identity
// ---------------------------------------------------------------------------

/// The external model providers the routing policy knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Groq,
    Perplexity,
    Xai,
}

impl ProviderId {
    /// All known providers, in a fixed (but not priority-significant) order.
    pub const ALL: [ProviderId; 6] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Groq,
        ProviderId::Perplexity,
        ProviderId::Xai,
    ];
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Groq => "groq",
            Self::Perplexity => "perplexity",
            Self::Xai => "xai",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an invalid [`ProviderId`] string.
#[derive(Debug, Clone)]
pub struct ProviderIdParseError(pub String);

impl fmt::Display for ProviderIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid provider id: {:?}", self.0)
    }
}

impl std::error::Error for ProviderIdParseError {}

impl FromStr for ProviderId {
    type Err = ProviderIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            "groq" => Ok(Self::Groq),
            "perplexity" => Ok(Self::Perplexity),
            "xai" => Ok(Self::Xai),
            other => Err(ProviderIdParseError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether this status is terminal (the worker will never mutate the
    /// run again once it reaches this state).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Decision trace step type
// ---------------------------------------------------------------------------

/// The kind of decision a [`DecisionTrace`] step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ProviderSelection,
    ContextAnalysis,
    Retry,
    Fallback,
    ResponseGeneration,
    ErrorHandling,
    SecurityValidation,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProviderSelection => "provider_selection",
            Self::ContextAnalysis => "context_analysis",
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::ResponseGeneration => "response_generation",
            Self::ErrorHandling => "error_handling",
            Self::SecurityValidation => "security_validation",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Approval status
// ---------------------------------------------------------------------------

/// Whether a [`DecisionTrace`] step required, and received, human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    NotRequired,
    Pending,
    Granted,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRequired => "not_required",
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task / Run
// ---------------------------------------------------------------------------

/// A unit of work handed to the queue. 1:1 with a [`Run`] at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub org_id: Uuid,
    /// Free-form text describing what the agent should accomplish.
    pub goal: String,
    pub mode: String,
    /// Higher sorts sooner.
    pub priority: i32,
    /// Zero for a first attempt; >0 marks a self-heal retry.
    pub iteration: u32,
    /// Provider hint from the producer; the routing policy treats this as
    /// the requested primary unless it is disabled or unhealthy.
    pub provider_hint: ProviderId,
    pub model: String,
}

/// The persisted mirror of a [`Task`] and its eventual result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub status: RunStatus,
    /// Provider requested at enqueue time (never mutated after creation).
    pub provider: ProviderId,
    pub model: String,
    /// The provider that actually produced the result, which may differ
    /// from `provider` after a fallback.
    pub used_provider: Option<ProviderId>,
    pub attempts: u32,
    /// Decimal string, e.g. `"0.0025"`, to avoid float rounding in cost math.
    pub cost_estimate: Option<String>,
    pub output: Option<RunOutput>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Build the initial `queued` Run for a freshly-accepted [`Task`].
    pub fn new(task: &Task, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id: task.run_id,
            project_id: task.project_id,
            org_id: task.org_id,
            status: RunStatus::Queued,
            provider: task.provider_hint,
            model: task.model.clone(),
            used_provider: None,
            attempts: 0,
            cost_estimate: None,
            output: None,
            created_at,
        }
    }
}

/// The `output` payload of a [`Run`]. Exactly one of `content`/`error` is
/// set, matching spec §3's invariant that `completed` implies non-null
/// content and `failed` implies non-null error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutput {
    Success { content: String },
    Error { error: String },
}

// ---------------------------------------------------------------------------
// DecisionTrace
// ---------------------------------------------------------------------------

/// An immutable, ordered step record for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub run_id: Uuid,
    /// 1-based, monotonically increasing per run with no gaps.
    pub step_number: u32,
    pub step_type: StepType,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub alternatives: Vec<String>,
    pub context_used: serde_json::Value,
    pub duration_ms: u64,
    pub approval_status: ApprovalStatus,
}

// ---------------------------------------------------------------------------
// Provider call types
// ---------------------------------------------------------------------------

/// Token/cost accounting for a single successful provider call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Decimal string.
    pub cost_estimate: String,
}

/// The outcome of [`crate::retry::call_with_retry`].
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub success: bool,
    pub content: Option<String>,
    pub used_provider: Option<ProviderId>,
    /// Cumulative attempts across every provider tried.
    pub attempts: u32,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}
