//! Approval gate (spec §4.4): block a worker on a low-confidence step
//! until an external approval decision arrives, or until a deadline
//! expires.
//!
//! The wait/timeout shape is grounded in the teacher's
//! `lifecycle::collect_events`, which races an agent's event stream
//! against `tokio::time::timeout` around a fixed wall-time budget. Here
//! the "event stream" is a single `tokio::sync::oneshot` resolved by
//! [`ApprovalGate::approve`] instead of a harness's stdout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

/// Why a wait on the approval gate ended without an explicit grant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval rejected: {0}")]
    Rejected(String),
    #[error("approval timeout")]
    Timeout,
    #[error("approval wait cancelled")]
    Cancelled,
    /// A second `wait_for_approval` was registered for a run that already
    /// has a pending waiter. Spec §4.4 / §9 call this a programming error
    /// that must fail fast rather than silently replace the waiter.
    #[error("a waiter is already registered for run {0}")]
    DuplicateWaiter(Uuid),
}

type Resolution = Result<(), ApprovalError>;

struct Waiter {
    sender: tokio::sync::oneshot::Sender<Resolution>,
}

/// Registers and resolves waiters for runs suspended at a low-confidence
/// decision step.
#[derive(Default)]
pub struct ApprovalGate {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

/// Default deadline for an approval wait (spec §4.4: "timeout at 5 min").
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until `approve`/`reject`/`cancel` resolves this run's
    /// waiter, or `timeout` elapses.
    ///
    /// Returns `Err(ApprovalError::DuplicateWaiter)` immediately, without
    /// suspending, if a waiter is already pending for `run_id` — per spec
    /// this is a programming error, not a race to arbitrate.
    pub async fn wait_for_approval(&self, run_id: Uuid, timeout: Duration) -> Resolution {
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut waiters = self.waiters.lock().unwrap();
            if waiters.contains_key(&run_id) {
                return Err(ApprovalError::DuplicateWaiter(run_id));
            }
            waiters.insert(run_id, Waiter { sender: tx });
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped without resolving (e.g. gate torn down).
            Ok(Err(_)) => Err(ApprovalError::Cancelled),
            Err(_elapsed) => Err(ApprovalError::Timeout),
        };

        // Clean up on every exit path, including the timeout path where
        // the entry is otherwise never removed.
        self.waiters.lock().unwrap().remove(&run_id);
        result
    }

    /// Resolve the waiter for `run_id`, if one is registered.
    ///
    /// Returns `false` if no waiter exists — including when this is called
    /// a second time for a run that already resolved once (spec §8:
    /// idempotent after the first call that finds a waiter).
    pub fn approve(&self, run_id: Uuid, approved: bool, reason: Option<String>) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(&run_id);
        let Some(waiter) = waiter else {
            return false;
        };
        let resolution = if approved {
            Ok(())
        } else {
            Err(ApprovalError::Rejected(
                reason.unwrap_or_else(|| "rejected".to_string()),
            ))
        };
        // A dropped receiver (the waiting task already gave up, e.g. on
        // cancellation) just means the send is a no-op.
        let _ = waiter.sender.send(resolution);
        true
    }

    /// Resolve the waiter for `run_id` with `Cancelled`, used when an
    /// in-flight run is cancelled out from under a pending approval.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(&run_id);
        let Some(waiter) = waiter else {
            return false;
        };
        let _ = waiter.sender.send(Err(ApprovalError::Cancelled));
        true
    }

    /// Whether a waiter is currently registered for `run_id`.
    pub fn is_pending(&self, run_id: Uuid) -> bool {
        self.waiters.lock().unwrap().contains_key(&run_id)
    }
}
