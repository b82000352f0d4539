//! The orchestrator: wires the queue, routing policy, decision tracer,
//! approval gate, and event hub into a running worker pool, and exposes
//! the four operations spec §6 names as the core's only public surface.
//!
//! The dispatch loop is grounded in the teacher's
//! `orchestrator::run_orchestrator`: a semaphore bounds concurrency, a
//! completion channel reports finished work back to the loop, and a
//! `CancellationToken` drains in-flight work on shutdown. It drops the
//! teacher's DAG-readiness bookkeeping (`get_ready_tasks`,
//! `is_plan_complete`) since this core schedules a flat priority queue,
//! not a dependency graph.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::events::{Event, EventHub, SubscriptionHandle};
use crate::model::{ProviderId, Run, RunStatus, Task};
use crate::ports::storage::RunUpdate;
use crate::queue::TaskQueue;
use crate::routing::{ProviderState, RoutingPolicy};
use crate::tracer::DecisionTracer;
use crate::worker::{run_task, Ports, WorkerContext};

/// A point-in-time snapshot returned by [`Orchestrator::get_health_metrics`].
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub providers: Vec<ProviderHealth>,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub completed_runs: u64,
    pub failed_runs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub healthy: bool,
    pub error_count: u32,
    pub consecutive_failures: u32,
}

impl From<ProviderState> for ProviderHealth {
    fn from(state: ProviderState) -> Self {
        Self {
            provider: state.id,
            healthy: state.healthy,
            error_count: state.error_count,
            consecutive_failures: state.consecutive_failures,
        }
    }
}

struct RunCounters {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Owns the queue and shared state, and runs the background dispatch loop
/// that feeds a bounded pool of workers.
pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    ports: Arc<Ports>,
    policy: Arc<RoutingPolicy>,
    tracer: Arc<DecisionTracer>,
    gate: Arc<ApprovalGate>,
    events: Arc<EventHub>,
    config: OrchestratorConfig,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    active_workers: Arc<AtomicUsize>,
    counters: Arc<RunCounters>,
    dispatch_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator and spawn its background dispatch loop.
    pub fn start(ports: Ports, provider_states: impl IntoIterator<Item = ProviderState>, config: OrchestratorConfig) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            queue: Arc::new(TaskQueue::new()),
            ports: Arc::new(ports),
            policy: Arc::new(RoutingPolicy::new(provider_states)),
            tracer: Arc::new(DecisionTracer::new(config.approval_confidence_threshold)),
            gate: Arc::new(ApprovalGate::new()),
            events: Arc::new(EventHub::new()),
            config,
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            cancellations: Mutex::new(HashMap::new()),
            active_workers: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(RunCounters { completed: AtomicUsize::new(0), failed: AtomicUsize::new(0) }),
            dispatch_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::dispatch_loop(Arc::clone(&orchestrator)));
        *orchestrator.dispatch_handle.lock().unwrap() = Some(handle);
        orchestrator
    }

    /// Accept a new task: persist its initial `queued` run, publish
    /// `task_queued`, and insert it into the priority queue.
    pub fn enqueue(&self, task: Task) -> Result<(), OrchestratorError> {
        let run = Run::new(&task, Utc::now());
        self.ports.storage.create_run(run, Utc::now())?;
        self.events.publish(Event::TaskQueued { run_id: task.run_id, priority: task.priority });
        self.queue.push(task);
        self.notify.notify_one();
        Ok(())
    }

    /// Resolve a pending approval wait for `run_id`.
    ///
    /// Returns `false` if no worker is currently waiting on this run — the
    /// run may have already completed, failed, or not yet reached a
    /// gated step.
    pub fn approve(&self, run_id: Uuid, approved: bool, reason: Option<String>) -> bool {
        self.gate.approve(run_id, approved, reason)
    }

    /// Register `handler` to receive every event published from this
    /// point on. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.events.subscribe(handler)
    }

    /// A read-only snapshot of provider health, queue depth, active
    /// worker count, and terminal-run totals.
    pub fn get_health_metrics(&self) -> HealthMetrics {
        HealthMetrics {
            providers: self.policy.snapshot_all().into_iter().map(ProviderHealth::from).collect(),
            queue_depth: self.queue.len(),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            completed_runs: self.counters.completed.load(Ordering::Relaxed) as u64,
            failed_runs: self.counters.failed.load(Ordering::Relaxed) as u64,
        }
    }

    /// Cancel `run_id`: remove it from the queue if it has not yet been
    /// dequeued, otherwise signal its cancellation token and resolve any
    /// pending approval wait as cancelled.
    ///
    /// An in-flight provider call is not interrupted mid-request — this
    /// cancels at the next safe point the worker checks, which today is
    /// only the approval wait, not every retry iteration (see DESIGN.md).
    pub fn cancel(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        if let Some(_task) = self.queue.remove(run_id) {
            let update = RunUpdate::default().status(RunStatus::Failed);
            self.ports.storage.update_run(run_id, update)?;
            return Ok(());
        }

        let token = self.cancellations.lock().unwrap().remove(&run_id);
        match token {
            Some(token) => {
                token.cancel();
                self.gate.cancel(run_id);
                Ok(())
            }
            None => Err(OrchestratorError::RunNotFound(run_id)),
        }
    }

    /// Re-enqueue `run_id` as a self-heal retry: bumps `iteration`, emits
    /// `task_healing`, and pushes the task back onto the queue. The
    /// decision of *when* to heal belongs to a caller outside this crate;
    /// this only performs the mechanics spec §9 binds to the core.
    pub fn requeue_for_heal(&self, mut task: Task, previous_error: impl Into<String>) {
        task.iteration += 1;
        self.events.publish(Event::TaskHealing {
            run_id: task.run_id,
            iteration: task.iteration,
            error: previous_error.into(),
        });
        self.queue.push(task);
        self.notify.notify_one();
    }

    /// Signal the dispatch loop to stop accepting new work and drain
    /// in-flight workers for up to `config.drain_timeout` before
    /// returning.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.active_workers.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let handle = self.dispatch_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));
        let (tx, mut rx) = mpsc::channel::<()>(self.config.worker_count * 2);

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit.expect("semaphore closed"),
                _ = self.shutdown.cancelled() => return,
            };

            let task = loop {
                if let Some(task) = self.queue.pop() {
                    break Some(task);
                }
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = rx.recv() => continue,
                    _ = self.shutdown.cancelled() => break None,
                }
            };

            let Some(task) = task else {
                drop(permit);
                return;
            };

            let run_id = task.run_id;
            let token = CancellationToken::new();
            self.cancellations.lock().unwrap().insert(run_id, token);

            let ctx = Arc::new(WorkerContext {
                ports: Arc::clone(&self.ports),
                policy: Arc::clone(&self.policy),
                tracer: Arc::clone(&self.tracer),
                gate: Arc::clone(&self.gate),
                events: Arc::clone(&self.events),
                config: self.config.clone(),
            });

            self.active_workers.fetch_add(1, Ordering::Relaxed);
            let active_workers = Arc::clone(&self.active_workers);
            let counters = Arc::clone(&self.counters);
            let storage = Arc::clone(&self.ports.storage);
            let cancellations_done_tx = tx.clone();
            let orch = Arc::clone(&self);

            tokio::spawn(async move {
                run_task(ctx, task).await;
                active_workers.fetch_sub(1, Ordering::Relaxed);
                orch.cancellations.lock().unwrap().remove(&run_id);

                match storage.get_run(run_id) {
                    Ok(Some(run)) if run.status == RunStatus::Completed => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Some(run)) if run.status == RunStatus::Failed => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }

                drop(permit);
                let _ = cancellations_done_tx.send(()).await;
            });
        }
    }
}

