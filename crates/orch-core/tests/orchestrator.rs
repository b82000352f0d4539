//! Tests for `Orchestrator`, run as an integration test so that
//! `orch_core` resolves to a single, consistent crate instance shared
//! with `orch-test-support` (avoids duplicate-crate-instance errors that
//! occur when these tests live inside `src/orchestrator.rs` as
//! `#[cfg(test)]`).

use std::sync::Arc;
use std::time::Duration;

use orch_core::config::OrchestratorConfig;
use orch_core::model::{ProviderId, RunStatus, Task};
use orch_core::orchestrator::Orchestrator;
use orch_core::ports::provider::ProviderCallOutcome;
use orch_core::ports::storage::StoragePort;
use orch_core::routing::{Capabilities, CostRates, ProviderState};
use orch_core::worker::Ports;
use orch_test_support::{InMemoryBudget, InMemoryStorage, InMemoryVault, RecordingWebhookPort, ScriptedProviderPort};
use uuid::Uuid;

fn ports(
    storage: Arc<InMemoryStorage>,
    provider: Arc<ScriptedProviderPort>,
    vault: Arc<InMemoryVault>,
) -> Ports {
    Ports {
        storage,
        provider,
        vault,
        webhook: Arc::new(RecordingWebhookPort::new()),
        budget: Arc::new(InMemoryBudget::new()),
    }
}

fn provider_states() -> Vec<ProviderState> {
    vec![ProviderState::new(
        ProviderId::OpenAi,
        0,
        Capabilities::default(),
        CostRates { input_per_1k: 0.001, output_per_1k: 0.002 },
    )]
}

fn task(run_id: Uuid, org_id: Uuid) -> Task {
    Task {
        run_id,
        project_id: Uuid::new_v4(),
        org_id,
        goal: "summarize".into(),
        mode: "default".into(),
        priority: 0,
        iteration: 0,
        provider_hint: ProviderId::OpenAi,
        model: "gpt-4o".into(),
    }
}

#[tokio::test]
async fn enqueue_runs_to_completion_and_health_metrics_reflect_it() {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = Arc::new(ScriptedProviderPort::new());
    let vault = Arc::new(InMemoryVault::new());

    let run_id = Uuid::new_v4();
    let org_id = Uuid::new_v4();
    let owner_user_id = Uuid::new_v4();
    storage.put_org(org_id, orch_core::ports::storage::OrgInfo { owner_user_id });
    vault.set(owner_user_id, ProviderId::OpenAi, "sk-test");
    provider.push(
        ProviderId::OpenAi,
        Ok(ProviderCallOutcome {
            content: "done".into(),
            usage: orch_core::model::Usage {
                input_tokens: 10,
                output_tokens: 5,
                cost_estimate: "0.0001".into(),
            },
        }),
    );

    let orchestrator = Orchestrator::start(
        ports(Arc::clone(&storage), provider, vault),
        provider_states(),
        OrchestratorConfig::default(),
    );

    orchestrator.enqueue(task(run_id, org_id)).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if storage.get_run(run_id).unwrap().unwrap().status == RunStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run did not complete in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let metrics = orchestrator.get_health_metrics();
    assert_eq!(metrics.completed_runs, 1);
    assert_eq!(metrics.queue_depth, 0);
}

#[tokio::test]
async fn cancel_removes_still_queued_task() {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = Arc::new(ScriptedProviderPort::new());
    let vault = Arc::new(InMemoryVault::new());

    // Zero workers: nothing will ever dequeue, so the task stays queued.
    let mut config = OrchestratorConfig::default();
    config.worker_count = 0;
    let orchestrator = Orchestrator::start(ports(storage, provider, vault), provider_states(), config);

    let run_id = Uuid::new_v4();
    let org_id = Uuid::new_v4();
    orchestrator.enqueue(task(run_id, org_id)).unwrap();
    assert_eq!(orchestrator.get_health_metrics().queue_depth, 1);

    orchestrator.cancel(run_id).unwrap();
    assert_eq!(orchestrator.get_health_metrics().queue_depth, 0);
}

#[tokio::test]
async fn approve_returns_false_when_no_worker_is_waiting() {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = Arc::new(ScriptedProviderPort::new());
    let vault = Arc::new(InMemoryVault::new());
    let orchestrator = Orchestrator::start(ports(storage, provider, vault), provider_states(), OrchestratorConfig::default());
    assert!(!orchestrator.approve(Uuid::new_v4(), true, None));
}
