//! End-to-end scenarios against a running [`Orchestrator`], one per
//! literal scenario enumerated for the worker lifecycle: happy path,
//! retry-then-success, fallback, all-providers-fail, approval granted,
//! approval timeout.

use std::sync::Arc;
use std::time::Duration;

use orch_core::config::OrchestratorConfig;
use orch_core::model::{ProviderId, RunOutput, RunStatus, Task};
use orch_core::orchestrator::Orchestrator;
use orch_core::ports::provider::{ProviderCallError, ProviderCallOutcome, TerminalReason};
use orch_core::ports::storage::{OrgInfo, StoragePort};
use orch_core::routing::{Capabilities, CostRates, ProviderState};
use orch_core::worker::Ports;
use orch_test_support::{InMemoryBudget, InMemoryStorage, InMemoryVault, RecordingWebhookPort, ScriptedProviderPort};
use uuid::Uuid;

fn two_provider_states() -> Vec<ProviderState> {
    vec![
        ProviderState::new(
            ProviderId::OpenAi,
            0,
            Capabilities::default(),
            CostRates { input_per_1k: 0.005, output_per_1k: 0.015 },
        ),
        ProviderState::new(
            ProviderId::Anthropic,
            1,
            Capabilities::default(),
            CostRates { input_per_1k: 0.003, output_per_1k: 0.015 },
        ),
    ]
}

fn one_provider_state() -> Vec<ProviderState> {
    vec![ProviderState::new(
        ProviderId::OpenAi,
        0,
        Capabilities::default(),
        CostRates { input_per_1k: 0.005, output_per_1k: 0.015 },
    )]
}

struct Harness {
    storage: Arc<InMemoryStorage>,
    provider: Arc<ScriptedProviderPort>,
    vault: Arc<InMemoryVault>,
    orchestrator: Arc<Orchestrator>,
    org_id: Uuid,
    owner_user_id: Uuid,
}

fn build(provider_states: Vec<ProviderState>, config: OrchestratorConfig) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = Arc::new(ScriptedProviderPort::new());
    let vault = Arc::new(InMemoryVault::new());
    let webhook = Arc::new(RecordingWebhookPort::new());
    let budget = Arc::new(InMemoryBudget::new());

    let org_id = Uuid::new_v4();
    let owner_user_id = Uuid::new_v4();
    storage.put_org(org_id, OrgInfo { owner_user_id });
    vault.set(owner_user_id, ProviderId::OpenAi, "sk-openai-test");
    vault.set(owner_user_id, ProviderId::Anthropic, "sk-anthropic-test");

    let orchestrator = Orchestrator::start(
        Ports {
            storage: Arc::clone(&storage) as _,
            provider: Arc::clone(&provider) as _,
            vault: Arc::clone(&vault) as _,
            webhook,
            budget,
        },
        provider_states,
        config,
    );

    Harness { storage, provider, vault, orchestrator, org_id, owner_user_id }
}

fn sample_task(org_id: Uuid) -> Task {
    Task {
        run_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        org_id,
        goal: "summarize X".to_string(),
        mode: "default".to_string(),
        priority: 0,
        iteration: 0,
        provider_hint: ProviderId::OpenAi,
        model: "gpt-4o".to_string(),
    }
}

async fn wait_for_status(storage: &InMemoryStorage, run_id: Uuid, status: RunStatus, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(run) = storage.get_run(run_id).unwrap() {
            if run.status == status {
                return;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "run never reached {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `approve` until a worker has actually registered a waiter for
/// `run_id` (it returns `false` until then).
async fn approve_when_ready(orchestrator: &Orchestrator, run_id: Uuid, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if orchestrator.approve(run_id, true, None) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "no approval waiter appeared for {run_id}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn s1_happy_path_primary_succeeds() {
    let harness = build(one_provider_state(), OrchestratorConfig::default());
    let task = sample_task(harness.org_id);
    let run_id = task.run_id;

    harness.provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "summary".to_string(),
            usage: orch_core::model::Usage {
                input_tokens: 100,
                output_tokens: 50,
                cost_estimate: "0.0025".to_string(),
            },
        }),
    );

    harness.orchestrator.enqueue(task).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::Completed, Duration::from_secs(5)).await;

    let run = harness.storage.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.used_provider, Some(ProviderId::OpenAi));
    assert_eq!(run.attempts, 1);
    assert_eq!(run.cost_estimate.as_deref(), Some("0.0025"));

    let traces = harness.storage.traces_for(run_id);
    assert!(traces.len() >= 3);
    let step_types: Vec<_> = traces.iter().map(|t| t.step_type).collect();
    assert!(step_types.contains(&orch_core::model::StepType::ProviderSelection));
    assert!(step_types.contains(&orch_core::model::StepType::ContextAnalysis));
    assert!(step_types.contains(&orch_core::model::StepType::ResponseGeneration));
}

#[tokio::test]
async fn s2_retry_then_success() {
    let mut config = OrchestratorConfig::default();
    config.retry_base_delay = Duration::from_millis(1);
    config.retry_max_delay = Duration::from_millis(2);
    let harness = build(one_provider_state(), config);
    let task = sample_task(harness.org_id);
    let run_id = task.run_id;

    harness.provider.push(
        ProviderId::OpenAi,
        Err(ProviderCallError::Transient { message: "rate limited".to_string() }),
    );
    harness.provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "summary".to_string(),
            usage: orch_core::model::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cost_estimate: "0.0005".to_string(),
            },
        }),
    );

    harness.orchestrator.enqueue(task).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::Completed, Duration::from_secs(5)).await;

    let run = harness.storage.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.attempts, 2);

    let traces = harness.storage.traces_for(run_id);
    let retry_trace = traces.iter().find(|t| t.step_type == orch_core::model::StepType::Retry).unwrap();
    assert_eq!(retry_trace.confidence, 0.8);
}

#[tokio::test]
async fn s3_fallback_to_secondary_provider() {
    let harness = build(two_provider_states(), OrchestratorConfig::default());
    let task = sample_task(harness.org_id);
    let run_id = task.run_id;

    harness.provider.push(
        ProviderId::OpenAi,
        Err(ProviderCallError::Terminal { message: "auth failed".to_string(), reason: TerminalReason::AuthFailed }),
    );
    harness.provider.push(
        ProviderId::Anthropic,
        Ok(ProviderCallOutcome {
            content: "summary".to_string(),
            usage: orch_core::model::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cost_estimate: "0.0005".to_string(),
            },
        }),
    );

    harness.orchestrator.enqueue(task).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::Completed, Duration::from_secs(5)).await;

    let run = harness.storage.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.used_provider, Some(ProviderId::Anthropic));
    assert_eq!(run.provider, ProviderId::OpenAi, "original requested provider must be preserved");

    let traces = harness.storage.traces_for(run_id);
    let fallback_trace = traces.iter().find(|t| t.step_type == orch_core::model::StepType::Fallback).unwrap();
    assert_eq!(fallback_trace.confidence, 0.85);

    let audit = harness.storage.audit_logs();
    let entry = audit.iter().find(|a| a.target == run_id.to_string()).unwrap();
    assert_eq!(entry.detail["provider"], "openai");
    assert_eq!(entry.detail["used_provider"], "anthropic");
}

#[tokio::test]
async fn s4_all_providers_fail() {
    let harness = build(one_provider_state(), OrchestratorConfig::default());
    let task = sample_task(harness.org_id);
    let run_id = task.run_id;

    for _ in 0..3 {
        harness.provider.push(
            ProviderId::OpenAi,
            Err(ProviderCallError::Terminal { message: "auth failed".to_string(), reason: TerminalReason::AuthFailed }),
        );
    }

    harness.orchestrator.enqueue(task).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::Failed, Duration::from_secs(5)).await;

    let run = harness.storage.get_run(run_id).unwrap().unwrap();
    assert!(matches!(run.output, Some(RunOutput::Error { .. })));
    assert!(harness.storage.usage_records().is_empty());

    let traces = harness.storage.traces_for(run_id);
    let error_trace = traces.iter().find(|t| t.step_type == orch_core::model::StepType::ErrorHandling).unwrap();
    assert_eq!(error_trace.confidence, 1.0);
}

#[tokio::test]
async fn s5_approval_required_then_granted() {
    // Inflating the threshold above both the primary-selection trace's 0.95
    // confidence and the context-analysis trace's 0.9 confidence gates the
    // run behind two approval waits in sequence.
    let mut config = OrchestratorConfig::default();
    config.approval_confidence_threshold = 0.99;
    config.approval_timeout = Duration::from_secs(30);
    let harness = build(one_provider_state(), config);
    let task = sample_task(harness.org_id);
    let run_id = task.run_id;

    harness.provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "summary".to_string(),
            usage: orch_core::model::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cost_estimate: "0.0005".to_string(),
            },
        }),
    );

    harness.orchestrator.enqueue(task).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::AwaitingApproval, Duration::from_secs(5)).await;

    approve_when_ready(&harness.orchestrator, run_id, Duration::from_secs(5)).await;
    approve_when_ready(&harness.orchestrator, run_id, Duration::from_secs(5)).await;
    wait_for_status(&harness.storage, run_id, RunStatus::Completed, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn s6_approval_timeout_fails_run_and_queue_continues() {
    let mut config = OrchestratorConfig::default();
    config.approval_confidence_threshold = 0.99;
    config.approval_timeout = Duration::from_millis(50);
    let harness = build(one_provider_state(), config);
    let timing_out = sample_task(harness.org_id);
    let run_id = timing_out.run_id;

    // Scripted but never reached: the run fails at the approval gate
    // before any provider call happens.
    harness.provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "unused".to_string(),
            usage: orch_core::model::Usage::default(),
        }),
    );

    harness.orchestrator.enqueue(timing_out).unwrap();
    wait_for_status(&harness.storage, run_id, RunStatus::Failed, Duration::from_secs(5)).await;

    let run = harness.storage.get_run(run_id).unwrap().unwrap();
    match run.output {
        Some(RunOutput::Error { error }) => assert!(error.contains("Approval timeout")),
        other => panic!("expected an error output, got {other:?}"),
    }

    // The queue continues: a second task on a fresh scripted success still
    // completes, proving the worker slot was released.
    let second = sample_task(harness.org_id);
    let second_run_id = second.run_id;
    harness.provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "second summary".to_string(),
            usage: orch_core::model::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cost_estimate: "0.0001".to_string(),
            },
        }),
    );
    harness.orchestrator.enqueue(second).unwrap();
    wait_for_status(&harness.storage, second_run_id, RunStatus::Completed, Duration::from_secs(5)).await;
}
