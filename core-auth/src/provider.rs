//! Identity provider seam.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{ExternalSession, ProviderKind};

/// Push notification from the identity provider.
///
/// Delivered for changes this process made (redirect completion, sign-out)
/// and for changes observed from elsewhere (another tab, server revocation).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    SignedIn(ExternalSession),
    SignedOut,
}

/// Client of a redirect-based identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Restore whatever session the provider persisted. Safe to call again.
    async fn initialize(&self) -> Result<()>;

    /// Current session, refreshed by the provider if it has expired.
    async fn get_session(&self) -> Result<Option<ExternalSession>>;

    /// Ask the provider for a new session regardless of expiry.
    async fn refresh_session(&self) -> Result<Option<ExternalSession>>;

    /// Navigate away to the provider's sign-in page. The outcome arrives
    /// later as [`ProviderEvent::SignedIn`].
    async fn sign_in_with_redirect(&self, provider: ProviderKind) -> Result<()>;

    async fn sign_out(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}
