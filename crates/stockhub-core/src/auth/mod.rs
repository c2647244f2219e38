//! Authentication module: who is signed in, and how that changes.
//!
//! This module provides:
//! - `SessionStore`: the single owner of `SessionState` and its `Epoch`
//! - `IdentityProvider`: the port to the external identity service
//! - `HttpIdentityProvider`: a GoTrue-style provider over HTTPS
//! - `SignInCredentials` / `Registration`: validated form input
//!
//! Every sign-in and sign-out bumps the epoch, which callers use to
//! discard results of work started under an older session.

pub mod credentials;
pub mod error;
pub mod http_provider;
pub mod provider;
pub mod session;
pub mod store;

pub use credentials::{Registration, SignInCredentials};
pub use error::{AuthError, ProviderError, ValidationError};
pub use http_provider::HttpIdentityProvider;
pub use provider::{IdentityProvider, ProviderEvent, SignUpOutcome};
pub use session::{Credential, Epoch, Identity, Session, SessionEvent, SessionState, TransitionCause};
pub use store::{SessionStore, Subscription, DEFAULT_INIT_TIMEOUT};
