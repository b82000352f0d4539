//! The webhook dispatch port.

use async_trait::async_trait;
use uuid::Uuid;

/// Best-effort outbound delivery of a single webhook event.
///
/// The core spawns this as a detached task (see
/// [`crate::worker::fire_webhook_best_effort`]) and never awaits
/// the result inline; failures are logged, never propagated, matching
/// spec §4.5 step 8 and §7's "webhook dispatch failures are logged and
/// swallowed".
#[async_trait]
pub trait WebhookDispatchPort: Send + Sync {
    async fn dispatch(
        &self,
        org_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;
}
