//! Decision tracer (spec §4.3): append an immutable, ordered log of
//! significant steps per run.
//!
//! Grounded in the teacher's `GateRunner` (`gator-core::gate::mod`), which
//! similarly wraps a storage write with a typed verdict and drives a state
//! transition from it — here the "verdict" is simply whether the step
//! needs approval. The per-run step counter is worker-local exactly as
//! spec §5 requires ("no suspension inside ... step counter increments");
//! it is a plain `HashMap<Uuid, u32>` behind a `Mutex` rather than, say,
//! an atomic, because a run is only ever on one worker at a time and the
//! map itself is shared only to be pruned on terminal (spec §9).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

use crate::model::{ApprovalStatus, DecisionTrace, StepType};
use crate::ports::storage::StoragePort;

/// Confidence strictly below this threshold requires approval, unless the
/// caller explicitly overrides via `TraceOptions::require_approval`.
/// Exactly `0.7` does **not** require approval (spec §8 boundary case).
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.7;

/// Optional overrides for a single [`DecisionTracer::trace`] call.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub alternatives: Vec<String>,
    pub context_used: Option<serde_json::Value>,
    pub start_time: Option<Instant>,
    /// `None` defers to the confidence threshold; `Some(v)` overrides it.
    pub require_approval: Option<bool>,
}

/// Result of [`DecisionTracer::trace`].
#[derive(Debug, Clone, Copy)]
pub struct TraceOutcome {
    /// Empty (nil) when the storage write failed; see module docs.
    pub trace_id: Uuid,
    pub requires_approval: bool,
}

/// Owns the per-run step counters and appends trace records through the
/// storage port.
pub struct DecisionTracer {
    step_counters: Mutex<HashMap<Uuid, u32>>,
    approval_threshold: f64,
}

impl DecisionTracer {
    pub fn new(approval_threshold: f64) -> Self {
        Self {
            step_counters: Mutex::new(HashMap::new()),
            approval_threshold,
        }
    }

    /// Append a trace step for `run_id`.
    ///
    /// Storage errors are logged and swallowed: tracing failures must
    /// never block execution (spec §4.3). On a storage error this returns
    /// `trace_id = Uuid::nil()` and `requires_approval = false` so callers
    /// never block waiting on a trace that was never recorded.
    pub fn trace(
        &self,
        storage: &dyn StoragePort,
        run_id: Uuid,
        step_type: StepType,
        decision: impl Into<String>,
        reasoning: impl Into<String>,
        confidence: f64,
        options: TraceOptions,
    ) -> TraceOutcome {
        let step_number = {
            let mut counters = self.step_counters.lock().unwrap();
            let counter = counters.entry(run_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let duration_ms = options
            .start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let requires_approval = options
            .require_approval
            .unwrap_or(confidence < self.approval_threshold);

        let approval_status = if requires_approval {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::NotRequired
        };

        let trace = DecisionTrace {
            run_id,
            step_number,
            step_type,
            decision: decision.into(),
            reasoning: reasoning.into(),
            confidence,
            alternatives: options.alternatives,
            context_used: options.context_used.unwrap_or(serde_json::json!({})),
            duration_ms,
            approval_status,
        };

        match storage.create_decision_trace(trace) {
            Ok(trace_id) => TraceOutcome {
                trace_id,
                requires_approval,
            },
            Err(err) => {
                tracing::warn!(
                    run_id = %run_id,
                    error = %err,
                    "failed to persist decision trace (non-fatal)"
                );
                TraceOutcome {
                    trace_id: Uuid::nil(),
                    requires_approval: false,
                }
            }
        }
    }

    /// Drop the step counter for a terminated run (spec §9: entries must
    /// be pruned on run terminal to prevent unbounded growth).
    pub fn forget(&self, run_id: Uuid) {
        self.step_counters.lock().unwrap().remove(&run_id);
    }

    pub fn approval_threshold(&self) -> f64 {
        self.approval_threshold
    }
}

impl Default for DecisionTracer {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_THRESHOLD)
    }
}

