//! The budget-tracking port.

use uuid::Uuid;

/// Records cost against an organization's budget.
///
/// Synchronous like [`crate::ports::storage::StoragePort`] — a real
/// implementation typically just increments a counter in the same store
/// `StoragePort` is backed by.
pub trait BudgetPort: Send + Sync {
    fn track_cost(&self, org_id: Uuid, amount_decimal_string: &str) -> anyhow::Result<()>;
}
