//! The credential vault port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::ProviderId;

/// Resolves a stored secret for a (user, provider) pair.
///
/// A missing credential is not an error per spec §7 (`CredentialMissing`);
/// callers pass `None` through to [`crate::ports::provider::ProviderPort`]
/// and let the provider call succeed or fail on its own terms.
#[async_trait]
pub trait CredentialVaultPort: Send + Sync {
    async fn get(&self, user_id: Uuid, service: ProviderId) -> Option<String>;
}
