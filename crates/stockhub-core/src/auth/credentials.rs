use std::fmt;

use super::ValidationError;

/// Maximum length for an email address (RFC 5321 path limit).
const MAX_EMAIL_LENGTH: usize = 254;

/// Maximum length for a password.
/// 128 chars accommodates password managers and passphrases.
const MAX_PASSWORD_LENGTH: usize = 128;

/// Maximum length for the optional full name given at sign-up.
const MAX_FULL_NAME_LENGTH: usize = 100;

/// Validated email/password pair handed to the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct SignInCredentials {
    email: String,
    password: String,
}

impl SignInCredentials {
    pub fn new(email: &str, password: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            email: validate_email(email)?,
            password: validate_password(password)?,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for SignInCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Sign-up request: credentials plus an optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub credentials: SignInCredentials,
    pub full_name: Option<String>,
}

impl Registration {
    pub fn new(email: &str, password: &str, full_name: Option<&str>) -> Result<Self, ValidationError> {
        let credentials = SignInCredentials::new(email, password)?;
        let full_name = match full_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) if name.chars().count() > MAX_FULL_NAME_LENGTH => {
                return Err(ValidationError::FullNameTooLong(MAX_FULL_NAME_LENGTH));
            }
            Some(name) => Some(name.to_string()),
            None => None,
        };
        Ok(Self {
            credentials,
            full_name,
        })
    }
}

fn validate_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::EmailTooLong(MAX_EMAIL_LENGTH));
    }
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(|c| c.is_whitespace() || c.is_control()) =>
        {
            Ok(email.to_string())
        }
        _ => Err(ValidationError::MalformedEmail),
    }
}

fn validate_password(password: &str) -> Result<String, ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyPassword);
    }
    if password.chars().count() > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooLong(MAX_PASSWORD_LENGTH));
    }
    // Passwords keep surrounding whitespace; only control characters are refused.
    if password.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacter);
    }
    Ok(password.to_string())
}
