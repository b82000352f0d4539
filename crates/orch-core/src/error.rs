//! Crate-level error type for operations exposed on
//! [`crate::orchestrator::Orchestrator`].
//!
//! Mirrors the teacher's split between a narrow `thiserror` enum per
//! subsystem (`ApprovalError`, `StorageError`) and a single top-level enum
//! that wraps them for the handful of operations that return all the way
//! out to a caller (`enqueue`, `approve`, `cancel`).

use uuid::Uuid;

use crate::ports::storage::StorageError;

/// Errors surfaced by the orchestrator's public operations.
///
/// Approval outcomes (`Rejected`, `Timeout`, `Cancelled`) are not
/// represented here: they are run *outcomes*, observed through the run's
/// terminal status and `output.error`, not through a call failing.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no providers available for this request")]
    NoProvidersAvailable,
    #[error("a waiter is already registered for run {0}")]
    DuplicateApprovalWaiter(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
    #[error("run {0} was cancelled")]
    Cancelled(Uuid),
}
