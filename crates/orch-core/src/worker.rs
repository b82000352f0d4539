//! Worker lifecycle (spec §4.5): the nine-step algorithm a single worker
//! runs for one dequeued [`Task`], end to end.
//!
//! Grounded in the teacher's `lifecycle::run_agent_lifecycle`, which drives
//! a single task through assign → start → run harness → checking → pass/
//! fail against the database, catching any error along the way and folding
//! it into a terminal state rather than letting it escape to the pool.
//! This module keeps that shape (one function, one task, swallow-and-record
//! on any failure) but replaces "spawn a subprocess harness" with "call a
//! routed, retried model provider".

use std::sync::Arc;

use uuid::Uuid;

use crate::approval::{ApprovalError, ApprovalGate};
use crate::config::OrchestratorConfig;
use crate::events::{Event, EventHub, LogLevel, RunResultSummary};
use crate::model::{ProviderId, Run, RunOutput, RunStatus, StepType, Task};
use crate::ports::budget::BudgetPort;
use crate::ports::provider::ProviderPort;
use crate::ports::storage::{MessageRole, NewAuditLog, NewMessage, NewUsageRecord, RunUpdate, StoragePort};
use crate::ports::vault::CredentialVaultPort;
use crate::ports::webhook::WebhookDispatchPort;
use crate::retry::{call_with_retry, AttemptEvent, RetryObserver};
use crate::routing::{RoutingPolicy, RoutingRequest};
use crate::tracer::{DecisionTracer, TraceOptions};

/// The five external ports a worker needs, bundled so call sites don't
/// thread five `Arc`s through every function signature.
pub struct Ports {
    pub storage: Arc<dyn StoragePort>,
    pub provider: Arc<dyn ProviderPort>,
    pub vault: Arc<dyn CredentialVaultPort>,
    pub webhook: Arc<dyn WebhookDispatchPort>,
    pub budget: Arc<dyn BudgetPort>,
}

/// Everything a worker needs that outlives any single task.
pub struct WorkerContext {
    pub ports: Arc<Ports>,
    pub policy: Arc<RoutingPolicy>,
    pub tracer: Arc<DecisionTracer>,
    pub gate: Arc<ApprovalGate>,
    pub events: Arc<EventHub>,
    pub config: OrchestratorConfig,
}

/// Builds the structured `context_used` attached to a [`crate::model::DecisionTrace`]:
/// prompt length (in estimated tokens), the capabilities this task's
/// provider call will require, and remaining budget, if known.
fn context_used_for(task: &Task, budget_remaining: Option<f64>) -> serde_json::Value {
    serde_json::json!({
        "prompt_tokens": crate::routing::estimate_tokens(&task.goal),
        "requested_capabilities": {
            "vision": false,
            "tools": false,
            "json_mode": false,
            "streaming": false,
        },
        "budget_remaining": budget_remaining,
    })
}

/// A failure that escaped the nine-step algorithm: the error message to
/// record on the run, and whether the run record itself could still be
/// found (an intake failure has no run to update).
struct WorkerFailure {
    message: String,
}

impl WorkerFailure {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Run the nine-step lifecycle for `task`. Never returns an `Err` to the
/// caller: any failure is folded into a `task_error` event and a `failed`
/// run, per spec §4.5's "workers never crash the pool".
pub async fn run_task(ctx: Arc<WorkerContext>, task: Task) {
    let run_id = task.run_id;
    ctx.events.publish(Event::TaskStarted { run_id, iteration: task.iteration });

    if let Err(failure) = run_steps(&ctx, &task).await {
        tracing::error!(run_id = %run_id, error = %failure.message, "worker lifecycle failed");
        ctx.events.publish(Event::TaskError { run_id, error: failure.message.clone() });

        let storage = Arc::clone(&ctx.ports.storage);
        let update = RunUpdate::default()
            .status(RunStatus::Failed)
            .output(RunOutput::Error { error: failure.message });
        let result = tokio::task::spawn_blocking(move || storage.update_run(run_id, update))
            .await
            .expect("blocking task panicked");
        if let Err(err) = result {
            tracing::warn!(run_id = %run_id, error = %err, "could not record run failure in storage");
        }
    }

    ctx.tracer.forget(run_id);
}

async fn run_steps(ctx: &Arc<WorkerContext>, task: &Task) -> Result<(), WorkerFailure> {
    let run_id = task.run_id;
    let storage = Arc::clone(&ctx.ports.storage);

    // Step 1: intake.
    let run = {
        let storage = Arc::clone(&storage);
        tokio::task::spawn_blocking(move || storage.get_run(run_id))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error on intake: {e}")))?
    };
    let Some(run) = run else {
        return Err(WorkerFailure::new(format!("run {run_id} not found at intake")));
    };

    // Step 2: primary selection trace.
    let primary = run.provider;
    let alternatives: Vec<String> = ctx
        .policy
        .snapshot_all()
        .into_iter()
        .filter(|p| p.enabled && p.id != primary)
        .map(|p| p.id.to_string())
        .collect();

    let outcome = ctx.tracer.trace(
        storage.as_ref(),
        run_id,
        StepType::ProviderSelection,
        format!("selected {primary}"),
        "requested provider from task, subject to health and capability filtering",
        0.95,
        TraceOptions {
            alternatives,
            context_used: Some(context_used_for(task, None)),
            ..Default::default()
        },
    );
    if outcome.requires_approval {
        await_approval(ctx, run_id).await?;
    }

    // Step 3: status update.
    {
        let storage = Arc::clone(&storage);
        let update = RunUpdate::default().status(RunStatus::Running);
        tokio::task::spawn_blocking(move || storage.update_run(run_id, update))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error marking run running: {e}")))?;
    }
    {
        let storage = Arc::clone(&storage);
        let message = NewMessage {
            project_id: task.project_id,
            run_id,
            role: MessageRole::User,
            content: task.goal.clone(),
        };
        tokio::task::spawn_blocking(move || storage.create_message(message))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error persisting goal message: {e}")))?;
    }

    // Step 4: context analysis trace.
    let outcome = ctx.tracer.trace(
        storage.as_ref(),
        run_id,
        StepType::ContextAnalysis,
        "proceeding with task goal as sole context",
        "no additional context sources configured",
        0.9,
        TraceOptions { context_used: Some(context_used_for(task, None)), ..Default::default() },
    );
    if outcome.requires_approval {
        await_approval(ctx, run_id).await?;
    }

    // Step 5: credential fetch.
    let org = {
        let storage = Arc::clone(&storage);
        let org_id = task.org_id;
        tokio::task::spawn_blocking(move || storage.get_org(org_id))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error resolving org: {e}")))?
    };
    let Some(org) = org else {
        return Err(WorkerFailure::new(format!("org {} not found", task.org_id)));
    };
    let credential = ctx.ports.vault.get(org.owner_user_id, primary).await;

    // Step 6: provider call via retry/fallback caller.
    let request = RoutingRequest {
        prompt: task.goal.clone(),
        requires_vision: false,
        requires_tools: false,
        requires_json_mode: false,
        requires_streaming: false,
        max_output_tokens: 4096,
        budget_remaining: None,
    };
    let observer = WorkerRetryObserver {
        run_id,
        storage: Arc::clone(&storage),
        tracer: Arc::clone(&ctx.tracer),
        events: Arc::clone(&ctx.events),
        context_used: context_used_for(task, request.budget_remaining),
    };
    let retry_config = ctx.config.retry_config();
    let response = call_with_retry(
        ctx.policy.as_ref(),
        ctx.ports.provider.as_ref(),
        primary,
        &request,
        &task.model,
        credential.as_deref(),
        &retry_config,
        &observer,
    )
    .await;

    // Step 7: terminal classification.
    if !response.success {
        let error = response.error.unwrap_or_else(|| "unknown provider error".to_string());
        ctx.tracer.trace(
            storage.as_ref(),
            run_id,
            StepType::ErrorHandling,
            "run failed: provider chain exhausted",
            error.clone(),
            1.0,
            TraceOptions {
                context_used: Some(context_used_for(task, request.budget_remaining)),
                ..Default::default()
            },
        );
        let update = RunUpdate::default()
            .status(RunStatus::Failed)
            .attempts(response.attempts)
            .output(RunOutput::Error { error: error.clone() });
        let storage2 = Arc::clone(&storage);
        tokio::task::spawn_blocking(move || storage2.update_run(run_id, update))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error recording failure: {e}")))?;
        ctx.events.publish(Event::TaskError { run_id, error: error.clone() });
        return Ok(());
    }

    // Step 8: success path.
    let content = response.content.clone().unwrap_or_default();
    let usage = response.usage.clone().unwrap_or_default();
    let used_provider = response.used_provider.unwrap_or(primary);

    {
        let storage = Arc::clone(&storage);
        let message = NewMessage {
            project_id: task.project_id,
            run_id,
            role: MessageRole::Assistant,
            content: content.clone(),
        };
        tokio::task::spawn_blocking(move || storage.create_message(message))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error persisting response: {e}")))?;
    }

    {
        let storage = Arc::clone(&storage);
        let update = RunUpdate::default()
            .status(RunStatus::Completed)
            .used_provider(used_provider)
            .attempts(response.attempts)
            .cost_estimate(usage.cost_estimate.clone())
            .output(RunOutput::Success { content: content.clone() });
        tokio::task::spawn_blocking(move || storage.update_run(run_id, update))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error recording completion: {e}")))?;
    }

    ctx.events.publish(Event::TaskCompleted {
        summary: RunResultSummary {
            run_id,
            used_provider,
            attempts: response.attempts,
            cost_estimate: usage.cost_estimate.clone(),
        },
    });

    fire_webhook_best_effort(ctx, task.org_id, run_id, used_provider, &usage.cost_estimate);

    ctx.tracer.trace(
        storage.as_ref(),
        run_id,
        StepType::ResponseGeneration,
        "response generated and persisted",
        format!("completed via {used_provider} after {} attempt(s)", response.attempts),
        0.95,
        TraceOptions {
            context_used: Some(context_used_for(task, request.budget_remaining)),
            ..Default::default()
        },
    );

    // Step 9: accounting.
    account_for_run(ctx, task, &run, used_provider, &usage).await?;

    Ok(())
}

/// Mark the run `awaiting_approval`, emit the warning log spec §8 (S5)
/// expects, and wait at the approval gate — translating every non-success
/// resolution into a terminal worker failure so the caller can fail the
/// run uniformly.
async fn await_approval(ctx: &Arc<WorkerContext>, run_id: Uuid) -> Result<(), WorkerFailure> {
    {
        let storage = Arc::clone(&ctx.ports.storage);
        let update = RunUpdate::default().status(RunStatus::AwaitingApproval);
        tokio::task::spawn_blocking(move || storage.update_run(run_id, update))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("storage error marking run awaiting approval: {e}")))?;
    }
    ctx.events.publish(Event::Log {
        run_id,
        level: LogLevel::Warning,
        message: "run suspended pending approval".to_string(),
    });

    match ctx.gate.wait_for_approval(run_id, ctx.config.approval_timeout).await {
        Ok(()) => {
            ctx.events.publish(Event::ApprovalGranted { run_id });
            Ok(())
        }
        Err(ApprovalError::Rejected(reason)) => {
            ctx.events.publish(Event::ApprovalRejected { run_id, reason: reason.clone() });
            Err(WorkerFailure::new(format!("approval rejected: {reason}")))
        }
        Err(ApprovalError::Timeout) => {
            ctx.events.publish(Event::ApprovalRejected {
                run_id,
                reason: "Approval timeout".to_string(),
            });
            Err(WorkerFailure::new("Approval timeout"))
        }
        Err(ApprovalError::Cancelled) => Err(WorkerFailure::new("run cancelled while awaiting approval")),
        Err(ApprovalError::DuplicateWaiter(id)) => {
            Err(WorkerFailure::new(format!("duplicate approval waiter registered for run {id}")))
        }
    }
}

fn fire_webhook_best_effort(
    ctx: &Arc<WorkerContext>,
    org_id: Uuid,
    run_id: Uuid,
    used_provider: ProviderId,
    cost_estimate: &str,
) {
    let webhook = Arc::clone(&ctx.ports.webhook);
    let payload = serde_json::json!({
        "run_id": run_id,
        "used_provider": used_provider.to_string(),
        "cost_estimate": cost_estimate,
    });
    tokio::spawn(async move {
        if let Err(err) = webhook.dispatch(org_id, "webhook.agent_run.completed", payload).await {
            tracing::warn!(run_id = %run_id, error = %err, "webhook dispatch failed (non-fatal)");
        }
    });
}

async fn account_for_run(
    ctx: &Arc<WorkerContext>,
    task: &Task,
    run: &Run,
    used_provider: ProviderId,
    usage: &crate::model::Usage,
) -> Result<(), WorkerFailure> {
    let cost: f64 = usage.cost_estimate.parse().unwrap_or(0.0);
    if cost > 0.0 {
        let budget = Arc::clone(&ctx.ports.budget);
        let org_id = task.org_id;
        let cost_estimate = usage.cost_estimate.clone();
        tokio::task::spawn_blocking(move || budget.track_cost(org_id, &cost_estimate))
            .await
            .expect("blocking task panicked")
            .map_err(|e| WorkerFailure::new(format!("budget tracking failed: {e}")))?;
    }

    let storage = Arc::clone(&ctx.ports.storage);
    let usage_record = NewUsageRecord {
        run_id: task.run_id,
        org_id: task.org_id,
        project_id: task.project_id,
        provider: used_provider,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost_estimate: usage.cost_estimate.clone(),
    };
    tokio::task::spawn_blocking(move || storage.create_usage_record(usage_record))
        .await
        .expect("blocking task panicked")
        .map_err(|e| WorkerFailure::new(format!("storage error writing usage record: {e}")))?;

    let storage = Arc::clone(&ctx.ports.storage);
    let audit = NewAuditLog {
        org_id: task.org_id,
        user_id: None,
        action: "run.completed".to_string(),
        target: run.run_id.to_string(),
        detail: serde_json::json!({
            "provider": run.provider.to_string(),
            "used_provider": used_provider.to_string(),
        }),
    };
    tokio::task::spawn_blocking(move || storage.create_audit_log(audit))
        .await
        .expect("blocking task panicked")
        .map_err(|e| WorkerFailure::new(format!("storage error writing audit log: {e}")))?;

    Ok(())
}

/// Bridges retry/fallback attempt events (spec §4.5 step 6) to the event
/// hub and decision tracer.
struct WorkerRetryObserver {
    run_id: Uuid,
    storage: Arc<dyn StoragePort>,
    tracer: Arc<DecisionTracer>,
    events: Arc<EventHub>,
    context_used: serde_json::Value,
}

#[async_trait::async_trait]
impl RetryObserver for WorkerRetryObserver {
    async fn on_attempt(&self, event: AttemptEvent) {
        self.events.publish(Event::Log {
            run_id: self.run_id,
            level: LogLevel::Warning,
            message: format!(
                "attempt {} against {} failed: {}",
                event.attempt_index, event.provider, event.error_message
            ),
        });

        match event.next_provider {
            Some(next) if next != event.provider => {
                self.tracer.trace(
                    self.storage.as_ref(),
                    self.run_id,
                    StepType::Fallback,
                    format!("falling back from {} to {next}", event.provider),
                    event.error_message.clone(),
                    0.85,
                    TraceOptions { context_used: Some(self.context_used.clone()), ..Default::default() },
                );
            }
            _ => {
                self.tracer.trace(
                    self.storage.as_ref(),
                    self.run_id,
                    StepType::Retry,
                    format!("retrying {}", event.provider),
                    event.error_message.clone(),
                    0.8,
                    TraceOptions { context_used: Some(self.context_used.clone()), ..Default::default() },
                );
            }
        }
    }
}
