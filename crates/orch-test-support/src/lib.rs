//! In-memory, scriptable port implementations for exercising `orch-core`
//! without a real database, HTTP client, vault, or webhook endpoint.
//!
//! Grounded in the teacher's `gator_test_utils` crate, which supplied a
//! `FakeHarness` that scripted agent subprocess behavior for
//! `gator-core`'s lifecycle tests; these fakes play the same role for the
//! five ports defined in `orch_core::ports`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use orch_core::model::{DecisionTrace, ProviderId, Run, Usage};
use orch_core::ports::provider::{ProviderCallError, ProviderCallOutcome, ProviderPort};
use orch_core::ports::storage::{
    NewAuditLog, NewMessage, NewUsageRecord, OrgInfo, RunUpdate, StorageError, StoragePort,
};
use orch_core::ports::{BudgetPort, CredentialVaultPort, WebhookDispatchPort};

/// An in-memory [`StoragePort`] backed by a handful of `Mutex<HashMap>`s.
///
/// Not meant to model concurrent-write semantics beyond "don't panic" —
/// its job is to give tests something to assert against, the same way
/// the teacher's fakes never tried to be a real Postgres.
#[derive(Default)]
pub struct InMemoryStorage {
    runs: Mutex<HashMap<Uuid, Run>>,
    messages: Mutex<Vec<NewMessage>>,
    traces: Mutex<HashMap<Uuid, Vec<DecisionTrace>>>,
    usage_records: Mutex<Vec<NewUsageRecord>>,
    audit_logs: Mutex<Vec<NewAuditLog>>,
    orgs: Mutex<HashMap<Uuid, OrgInfo>>,
    /// When set, every method that can fail returns this error instead of
    /// touching its backing map. Used to exercise the "storage errors are
    /// logged and swallowed" path in the decision tracer.
    fail_with: Mutex<Option<String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every fallible method return `Err(StorageError::Unavailable)`.
    pub fn set_failing(&self, reason: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(reason.into());
    }

    pub fn clear_failing(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    fn check_failing(&self) -> Result<(), StorageError> {
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(StorageError::Unavailable(reason));
        }
        Ok(())
    }

    /// All decision traces recorded for `run_id`, in insertion order.
    pub fn traces_for(&self, run_id: Uuid) -> Vec<DecisionTrace> {
        self.traces.lock().unwrap().get(&run_id).cloned().unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<NewMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn usage_records(&self) -> Vec<NewUsageRecord> {
        self.usage_records.lock().unwrap().clone()
    }

    pub fn audit_logs(&self) -> Vec<NewAuditLog> {
        self.audit_logs.lock().unwrap().clone()
    }

    pub fn put_org(&self, org_id: Uuid, info: OrgInfo) {
        self.orgs.lock().unwrap().insert(org_id, info);
    }
}

impl StoragePort for InMemoryStorage {
    fn create_run(&self, run: Run, _created_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.check_failing()?;
        self.runs.lock().unwrap().insert(run.run_id, run);
        Ok(())
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StorageError> {
        self.check_failing()?;
        Ok(self.runs.lock().unwrap().get(&run_id).cloned())
    }

    fn update_run(&self, run_id: Uuid, fields: RunUpdate) -> Result<(), StorageError> {
        self.check_failing()?;
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id).ok_or(StorageError::RunNotFound(run_id))?;
        if let Some(status) = fields.status {
            run.status = status;
        }
        if let Some(provider) = fields.used_provider {
            run.used_provider = Some(provider);
        }
        if let Some(attempts) = fields.attempts {
            run.attempts = attempts;
        }
        if let Some(cost) = fields.cost_estimate {
            run.cost_estimate = Some(cost);
        }
        if let Some(output) = fields.output {
            run.output = Some(output);
        }
        Ok(())
    }

    fn create_message(&self, message: NewMessage) -> Result<(), StorageError> {
        self.check_failing()?;
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    fn create_decision_trace(&self, trace: DecisionTrace) -> Result<Uuid, StorageError> {
        self.check_failing()?;
        let trace_id = Uuid::new_v4();
        self.traces.lock().unwrap().entry(trace.run_id).or_default().push(trace);
        Ok(trace_id)
    }

    fn create_usage_record(&self, record: NewUsageRecord) -> Result<(), StorageError> {
        self.check_failing()?;
        self.usage_records.lock().unwrap().push(record);
        Ok(())
    }

    fn create_audit_log(&self, entry: NewAuditLog) -> Result<(), StorageError> {
        self.check_failing()?;
        self.audit_logs.lock().unwrap().push(entry);
        Ok(())
    }

    fn get_org(&self, org_id: Uuid) -> Result<Option<OrgInfo>, StorageError> {
        self.check_failing()?;
        Ok(self.orgs.lock().unwrap().get(&org_id).copied())
    }
}

/// A scripted response queue for [`ProviderPort`], keyed by provider.
///
/// Each call to `call` for a given provider pops the next scripted result
/// for that provider; an exhausted queue panics, which surfaces test
/// setup mistakes immediately rather than hanging.
#[derive(Default)]
pub struct ScriptedProviderPort {
    scripts: Mutex<HashMap<ProviderId, Vec<Result<ProviderCallOutcome, ProviderCallError>>>>,
    calls: Mutex<Vec<ProviderId>>,
}

impl ScriptedProviderPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, provider: ProviderId, result: Result<ProviderCallOutcome, ProviderCallError>) {
        self.scripts.lock().unwrap().entry(provider).or_default().push(result);
    }

    pub fn calls(&self) -> Vec<ProviderId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderPort for ScriptedProviderPort {
    async fn call(
        &self,
        provider: ProviderId,
        _prompt: &str,
        _model: &str,
        _credential: Option<&str>,
        _max_output_tokens: u32,
    ) -> Result<ProviderCallOutcome, ProviderCallError> {
        self.calls.lock().unwrap().push(provider);
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(provider).or_default();
        if queue.is_empty() {
            panic!("ScriptedProviderPort: no scripted response left for {provider}");
        }
        queue.remove(0)
    }
}

/// An in-memory credential vault seeded with a fixed map.
#[derive(Default)]
pub struct InMemoryVault {
    secrets: Mutex<HashMap<(Uuid, ProviderId), String>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: Uuid, provider: ProviderId, secret: impl Into<String>) {
        self.secrets.lock().unwrap().insert((user_id, provider), secret.into());
    }
}

#[async_trait]
impl CredentialVaultPort for InMemoryVault {
    async fn get(&self, user_id: Uuid, service: ProviderId) -> Option<String> {
        self.secrets.lock().unwrap().get(&(user_id, service)).cloned()
    }
}

/// A webhook port that records every dispatch instead of sending it.
#[derive(Default)]
pub struct RecordingWebhookPort {
    dispatches: Mutex<Vec<(Uuid, String, serde_json::Value)>>,
}

impl RecordingWebhookPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatches(&self) -> Vec<(Uuid, String, serde_json::Value)> {
        self.dispatches.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookDispatchPort for RecordingWebhookPort {
    async fn dispatch(
        &self,
        org_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.dispatches.lock().unwrap().push((org_id, event_type.to_string(), payload));
        Ok(())
    }
}

/// A budget port that sums tracked costs per org as `f64`, good enough for
/// test assertions without pulling in a decimal crate.
#[derive(Default)]
pub struct InMemoryBudget {
    totals: Mutex<HashMap<Uuid, f64>>,
}

impl InMemoryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_for(&self, org_id: Uuid) -> f64 {
        self.totals.lock().unwrap().get(&org_id).copied().unwrap_or(0.0)
    }
}

impl BudgetPort for InMemoryBudget {
    fn track_cost(&self, org_id: Uuid, amount_decimal_string: &str) -> anyhow::Result<()> {
        let amount: f64 = amount_decimal_string.parse()?;
        *self.totals.lock().unwrap().entry(org_id).or_insert(0.0) += amount;
        Ok(())
    }
}

/// Convenience builder for a [`Usage`] in tests.
pub fn usage(input_tokens: u64, output_tokens: u64, cost_estimate: &str) -> Usage {
    Usage {
        input_tokens,
        output_tokens,
        cost_estimate: cost_estimate.to_string(),
    }
}
