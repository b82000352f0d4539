//! The storage port: the only way the core reads or writes persisted state.
//!
//! Modeled as a synchronous, object-safe trait — the core treats storage as
//! "may block, but does not suspend the executor on its own schedule" the
//! same way the teacher treats its database pool as an opaque handle behind
//! `gator_db::queries::*`. Callers that run on the async worker invoke these
//! methods through [`tokio::task::spawn_blocking`] (see
//! [`crate::worker::run_task`]) rather than awaiting them directly.
//!
//! No concrete storage engine lives in this crate; `orch-test-support`
//! provides an in-memory implementation for tests, and an embedder supplies
//! its own (Postgres, sqlite, a KV store, whatever fits).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{DecisionTrace, ProviderId, Run, RunOutput, RunStatus};

/// Errors a storage port implementation can return.
///
/// Per spec §7, a `StorageError` is logged and swallowed when it occurs
/// while persisting a decision trace (tracing must never block execution),
/// but is fatal to the worker's ability to record a run's terminal state.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("storage operation failed: {0}")]
    Other(String),
}

/// A conversational message attached to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

/// Input to [`StoragePort::create_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub project_id: Uuid,
    pub run_id: Uuid,
    pub role: MessageRole,
    pub content: String,
}

/// Input to [`StoragePort::create_usage_record`].
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub run_id: Uuid,
    pub org_id: Uuid,
    pub project_id: Uuid,
    pub provider: ProviderId,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Decimal string.
    pub cost_estimate: String,
}

/// Input to [`StoragePort::create_audit_log`].
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub target: String,
    pub detail: serde_json::Value,
}

/// Minimal org record the worker needs to resolve a credential.
#[derive(Debug, Clone, Copy)]
pub struct OrgInfo {
    pub owner_user_id: Uuid,
}

/// A partial update to a [`Run`]. Every field is optional; `None` means
/// "leave unchanged". This mirrors the teacher's `update_run(run_id,
/// fields)` signature from spec §6 rather than forcing callers to fetch,
/// mutate, and write back the whole record.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub used_provider: Option<ProviderId>,
    pub attempts: Option<u32>,
    pub cost_estimate: Option<String>,
    pub output: Option<RunOutput>,
}

impl RunUpdate {
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn used_provider(mut self, provider: ProviderId) -> Self {
        self.used_provider = Some(provider);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn cost_estimate(mut self, cost: impl Into<String>) -> Self {
        self.cost_estimate = Some(cost.into());
        self
    }

    pub fn output(mut self, output: RunOutput) -> Self {
        self.output = Some(output);
        self
    }
}

/// The storage port.
///
/// Object-safe so it can be stored as `Arc<dyn StoragePort>` inside the
/// [`crate::orchestrator::Orchestrator`], the same way the teacher stores
/// `Box<dyn Harness>` in its `HarnessRegistry`.
pub trait StoragePort: Send + Sync {
    /// Create the initial `queued` run for a freshly-accepted task.
    ///
    /// Not named explicitly among spec §6's storage operations, but
    /// required to satisfy `get_run` ever returning `Some` for a run the
    /// core itself just accepted; see `DESIGN.md` for the rationale.
    fn create_run(&self, run: Run, created_at: DateTime<Utc>) -> Result<(), StorageError>;

    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StorageError>;

    fn update_run(&self, run_id: Uuid, fields: RunUpdate) -> Result<(), StorageError>;

    fn create_message(&self, message: NewMessage) -> Result<(), StorageError>;

    /// Persist a decision trace step. Returns an opaque trace id.
    fn create_decision_trace(&self, trace: DecisionTrace) -> Result<Uuid, StorageError>;

    fn create_usage_record(&self, record: NewUsageRecord) -> Result<(), StorageError>;

    fn create_audit_log(&self, entry: NewAuditLog) -> Result<(), StorageError>;

    fn get_org(&self, org_id: Uuid) -> Result<Option<OrgInfo>, StorageError>;
}
