//! Port to the external identity provider.
//!
//! The provider owns credential persistence and the sign-in protocol. Only
//! [`SessionStore`](super::SessionStore) talks to it.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ProviderError, Registration, Session, SignInCredentials};

/// Change pushed by the provider outside of a store-initiated call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Same principal, new credential.
    TokenRefreshed(Session),
    /// The session ended on the provider side (revoked, expired, signed out elsewhere).
    SignedOut,
}

/// What a sign-up produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    /// Account created and signed in immediately.
    SignedIn(Session),
    /// Account created; the user has to confirm their email before signing in.
    ConfirmationRequired,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Session saved by a previous run, if still usable.
    async fn persisted_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Obtain a session. It is not kept until the store calls
    /// [`activate`](Self::activate) with it.
    async fn sign_in(&self, credentials: &SignInCredentials) -> Result<Session, ProviderError>;

    async fn sign_up(&self, registration: &Registration) -> Result<SignUpOutcome, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// The store committed `session` (from `sign_in` or `sign_up`); it is now
    /// the one to keep and persist. Called while transitions are serialized,
    /// so it must not block on I/O beyond local storage.
    fn activate(&self, _session: &Session) {}

    /// The store will never use `session`: a newer sign-in or a sign-out
    /// overtook it. Forget it if held and revoke it.
    async fn discard(&self, _session: &Session) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Renew the active credential if it is close to expiry. Returns whether
    /// a renewal happened; the new session arrives as
    /// [`ProviderEvent::TokenRefreshed`].
    async fn refresh_if_due(&self) -> Result<bool, ProviderError> {
        Ok(false)
    }

    /// Receiver for provider-pushed changes. Providers without push support
    /// return `None`.
    fn auth_events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }
}
