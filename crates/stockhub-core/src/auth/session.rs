use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key the identity provider uses for the user's full name.
const FULL_NAME_KEY: &str = "full_name";

/// The signed-in principal as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    /// Name to greet the user with: full name when known, email otherwise.
    pub fn display_name(&self) -> &str {
        self.metadata
            .get(FULL_NAME_KEY)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(self.email.as_str())
    }
}

/// Bearer token with an optional expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    /// Time left before expiry, `None` for tokens without one.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }
}

// Tokens end up in log lines through `?state`; never print them.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub identity: Identity,
    pub credential: Credential,
}

impl Session {
    pub fn new(identity: Identity, credential: Credential) -> Self {
        Self {
            identity,
            credential,
        }
    }

    pub fn token(&self) -> &str {
        self.credential.token()
    }
}

/// The single source of truth for "is the user signed in".
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Loading,
    Authenticated(Session),
    Anonymous,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    /// Bearer token if a session is active
    pub fn token(&self) -> Option<&str> {
        self.session().map(Session::token)
    }

    /// Short name for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Loading => "loading",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Anonymous => "anonymous",
        }
    }
}

/// Generation counter bumped on every sign-in and sign-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a transition was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// `initialize()` started querying the provider
    Loading,
    /// A persisted session was found during start-up
    Restored,
    /// Start-up found no session, failed or timed out
    RestoreFailed,
    SignedIn,
    SignedOut,
    /// The request layer saw an unauthorized response
    ForcedSignOut,
    /// The provider rotated the credential of the current session
    Refreshed,
    /// The provider reported the session ended on its side
    ProviderSignedOut,
}

/// What subscribers receive after every committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub state: SessionState,
    pub epoch: Epoch,
    pub cause: TransitionCause,
}
