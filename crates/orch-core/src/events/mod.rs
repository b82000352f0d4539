//! Event hub (spec §4.6): typed pub/sub fan-out of lifecycle events to
//! subscribers such as a webhook dispatcher or an SSE streamer.
//!
//! Grounded in the teacher's `EventBus` shape from the wider corpus (a
//! `tokio::sync` channel wrapped behind `publish`/`subscribe`), but spec
//! §4.6 asks for *handler* subscription rather than a receiver handle, and
//! for delivery that never blocks the publisher even when a subscriber is
//! slow. Each subscriber therefore gets its own bounded `mpsc` queue and a
//! dedicated background task that drains it and invokes the handler —
//! the publisher only ever does a non-blocking `try_send`, satisfying
//! spec §4.6 ("a slow subscriber must not stall the worker").
//!
//! This deliberately replaces the source system's string-keyed event
//! emitter (see spec §9 "Event-emitter pattern") with a closed `Event`
//! enum: there is no event name a subscriber can typo, and no
//! remove-by-function-identity bookkeeping since a subscription is
//! dropped by dropping its `SubscriptionHandle`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

use crate::model::ProviderId;

/// Severity of a [`Event::Log`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Summary of a completed run, attached to [`Event::TaskCompleted`].
#[derive(Debug, Clone, Serialize)]
pub struct RunResultSummary {
    pub run_id: Uuid,
    pub used_provider: ProviderId,
    pub attempts: u32,
    pub cost_estimate: String,
}

/// The closed set of events the hub can carry (spec §4.6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskQueued { run_id: Uuid, priority: i32 },
    TaskStarted { run_id: Uuid, iteration: u32 },
    TaskCompleted { summary: RunResultSummary },
    TaskHealing { run_id: Uuid, iteration: u32, error: String },
    TaskError { run_id: Uuid, error: String },
    Log { run_id: Uuid, level: LogLevel, message: String },
    ApprovalGranted { run_id: Uuid },
    ApprovalRejected { run_id: Uuid, reason: String },
}

impl Event {
    /// The run this event concerns, when it concerns exactly one run.
    pub fn run_id(&self) -> Uuid {
        match self {
            Event::TaskQueued { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskHealing { run_id, .. }
            | Event::TaskError { run_id, .. }
            | Event::Log { run_id, .. }
            | Event::ApprovalGranted { run_id }
            | Event::ApprovalRejected { run_id, .. } => *run_id,
            Event::TaskCompleted { summary } => summary.run_id,
        }
    }
}

/// Capacity of each subscriber's private queue. A subscriber that falls
/// this far behind starts dropping the *newest* event — `try_send` fails
/// on the event currently being published rather than evicting anything
/// already queued — instead of back-pressuring the publisher.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// A registered subscription. Dropping this unsubscribes and stops the
/// background delivery task.
pub struct SubscriptionHandle {
    id: u64,
    hub: std::sync::Weak<HubInner>,
    _task: tokio::task::JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

struct HubInner {
    subscribers: Mutex<Vec<(u64, tokio::sync::mpsc::Sender<Event>)>>,
    next_id: AtomicU64,
}

/// Typed pub/sub fan-out, at-least-once within the process, no
/// persistence, no cross-process delivery (spec §4.6).
#[derive(Clone)]
pub struct EventHub {
    inner: std::sync::Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `handler` to be invoked, in order, for every event
    /// published after this call. The handler runs on its own background
    /// task, so a slow or panicking handler cannot stall `publish`.
    pub fn subscribe<F>(&self, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(Event) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = tokio::sync::mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.inner.subscribers.lock().unwrap().push((id, tx));

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });

        SubscriptionHandle {
            id,
            hub: std::sync::Arc::downgrade(&self.inner),
            _task: task,
        }
    }

    /// Publish `event` to every current subscriber. Never suspends the
    /// caller: delivery to each subscriber is a non-blocking `try_send`,
    /// and a full queue drops the event for that subscriber only (logged
    /// at debug level) rather than blocking the worker that published it.
    pub fn publish(&self, event: Event) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for (id, tx) in subscribers.iter() {
            if let Err(err) = tx.try_send(event.clone()) {
                tracing::debug!(subscriber_id = id, error = %err, "dropping event for lagging subscriber");
            }
        }
    }

    /// Current subscriber count, mostly useful for `get_health_metrics`
    /// and tests.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
