use thiserror::Error;

/// Malformed input rejected before the identity provider is contacted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Email is required")]
    EmptyEmail,

    #[error("Email address is not valid")]
    MalformedEmail,

    #[error("Email must be at most {0} characters")]
    EmailTooLong(usize),

    #[error("Password is required")]
    EmptyPassword,

    #[error("Password must be at most {0} characters")]
    PasswordTooLong(usize),

    #[error("Password contains control characters")]
    ControlCharacter,

    #[error("Full name must be at most {0} characters")]
    FullNameTooLong(usize),
}

/// Failure reported by an identity provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No response was received (connect failure, timeout, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered and refused the request.
    #[error("Rejected by identity provider: {0}")]
    Rejected(String),

    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Result of a sign-in or sign-up attempt that did not produce a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A sign-out or another sign-in completed while this attempt was pending.
    #[error("Sign-in superseded by a newer session change")]
    Superseded,
}

impl AuthError {
    /// Message suitable for showing next to the sign-in form.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Validation(e) => e.to_string(),
            AuthError::Provider(ProviderError::Rejected(_)) => {
                "Invalid email or password".to_string()
            }
            AuthError::Provider(ProviderError::Network(_)) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Provider(ProviderError::InvalidResponse(_)) => {
                "Sign-in service returned an unexpected response. Please try again.".to_string()
            }
            AuthError::Superseded => "Session changed while signing in. Please try again.".to_string(),
        }
    }
}
