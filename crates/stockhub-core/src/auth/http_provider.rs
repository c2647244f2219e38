//! Identity provider speaking a GoTrue-style token API.
//!
//! The provider keeps the current session (and its refresh token) in
//! `session.json` under the cache directory so a restart can restore it.
//! Nothing outside this file reads or writes that file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    Credential, Identity, IdentityProvider, ProviderError, ProviderEvent, Registration, Session,
    SignInCredentials, SignUpOutcome,
};
use crate::config::Config;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Header carrying the provider's public key on every call.
const API_KEY_HEADER: &str = "apikey";

/// Refresh this long before the access token expires.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Capacity of the auth-change broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Maximum length of a provider error body quoted in errors.
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    session: Session,
    refresh_token: Option<String>,
    saved_at: DateTime<Utc>,
}

impl StoredSession {
    fn needs_refresh(&self) -> bool {
        match self.session.credential.expires_in() {
            Some(left) => left < chrono::Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    user: UserPayload,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl TokenResponse {
    fn into_stored(self) -> StoredSession {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        let identity = Identity {
            id: self.user.id,
            email: self.user.email.unwrap_or_default(),
            metadata: self.user.user_metadata,
        };
        StoredSession {
            session: Session::new(identity, Credential::new(self.access_token, expires_at)),
            refresh_token: self.refresh_token,
            saved_at: Utc::now(),
        }
    }
}

/// What the provider holds in memory. `generation` moves whenever `current`
/// is replaced or cleared, so a network call can tell if the session it
/// started from is still the one held.
#[derive(Default)]
struct Slot {
    current: Option<StoredSession>,
    generation: u64,
    /// Issued by sign-in or sign-up, waiting for `activate` or `discard`.
    pending: Vec<StoredSession>,
}

pub struct HttpIdentityProvider {
    client: Client,
    auth_url: String,
    api_key: String,
    cache_dir: Option<PathBuf>,
    slot: Mutex<Slot>,
    events: broadcast::Sender<ProviderEvent>,
}

impl HttpIdentityProvider {
    pub fn new(auth_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            auth_url: auth_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            cache_dir: None,
            slot: Mutex::new(Slot::default()),
            events,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = Self::new(&config.auth_url, &config.auth_key, config.request_timeout())?;
        Ok(provider.with_cache_dir(config.cache_dir()?))
    }

    /// Persist sessions under `dir` so they survive restarts.
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Returns `Ok(None)` when the session changed (sign-out, new sign-in)
    /// while the request was in flight; the result is then dropped.
    pub async fn refresh(&self) -> Result<Option<Session>, ProviderError> {
        let (generation, refresh_token) = {
            let slot = self.slot.lock();
            let token = slot.current.as_ref().and_then(|stored| stored.refresh_token.clone());
            (slot.generation, token)
        };
        let refresh_token =
            refresh_token.ok_or_else(|| ProviderError::Rejected("no refresh token".to_string()))?;
        self.refresh_from(generation, &refresh_token).await
    }

    async fn refresh_from(&self, generation: u64, refresh_token: &str) -> Result<Option<Session>, ProviderError> {
        let stored = self.refresh_with(refresh_token).await?;
        let session = stored.session.clone();
        if !self.remember_if(generation, stored) {
            debug!("Discarding refresh result, session changed meanwhile");
            return Ok(None);
        }
        info!("Access token refreshed");
        let _ = self.events.send(ProviderEvent::TokenRefreshed(session.clone()));
        Ok(Some(session))
    }

    // ===== HTTP =====

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.auth_url, path)
    }

    async fn post_token<B: Serialize>(&self, grant_type: &str, body: &B) -> Result<StoredSession, ProviderError> {
        let response = self
            .client
            .post(self.url("token"))
            .query(&[("grant_type", grant_type)])
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.into_stored())
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<StoredSession, ProviderError> {
        self.post_token(
            "refresh_token",
            &serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    /// Revoke `token` on the provider side.
    async fn logout(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url("logout"))
            .header(API_KEY_HEADER, &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        // An already-revoked token is as signed out as it gets.
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        Self::check_response(response).await?;
        Ok(())
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::error_from_status(status, &body))
    }

    fn error_from_status(status: StatusCode, body: &str) -> ProviderError {
        let reason = serde_json::from_str::<ErrorPayload>(body)
            .ok()
            .and_then(|p| p.error_description.or(p.msg).or(p.message).or(p.error))
            .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_LENGTH).collect());

        if status.is_client_error() {
            ProviderError::Rejected(reason)
        } else {
            ProviderError::InvalidResponse(format!("Status {}: {}", status, reason))
        }
    }

    // ===== Persistence =====
    //
    // The file is only written or removed under the slot lock, so it always
    // matches `current`.

    fn session_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(SESSION_FILE))
    }

    fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    fn store_current(&self, slot: &mut Slot, stored: StoredSession) {
        if let Some(path) = self.session_path() {
            if let Err(e) = save_session(&path, &stored) {
                warn!(error = %e, "Failed to save session");
            }
        }
        slot.current = Some(stored);
        slot.generation += 1;
    }

    fn clear_current(&self, slot: &mut Slot) -> Option<StoredSession> {
        if let Some(path) = self.session_path() {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(error = %e, "Failed to remove session file");
                }
            }
        }
        slot.generation += 1;
        slot.current.take()
    }

    /// Keep `stored` unless the session changed since `generation`.
    fn remember_if(&self, generation: u64, stored: StoredSession) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        self.store_current(&mut slot, stored);
        true
    }

    fn forget(&self) -> Option<StoredSession> {
        let mut slot = self.slot.lock();
        self.clear_current(&mut slot)
    }

    /// Forget the current session unless it changed since `generation`.
    fn forget_if(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        self.clear_current(&mut slot);
        true
    }
}

fn load_session(path: &Path) -> Result<Option<StoredSession>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn save_session(path: &Path, stored: &StoredSession) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(stored)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn persisted_session(&self) -> Result<Option<Session>, ProviderError> {
        let Some(path) = self.session_path() else {
            return Ok(None);
        };
        // A session restored after a sign-in or sign-out overtook us is
        // returned but not kept; the store discards it.
        let generation = self.generation();

        let stored = match load_session(&path) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session file");
                self.forget_if(generation);
                return Ok(None);
            }
        };

        if !stored.session.credential.is_expired() {
            debug!(saved_at = %stored.saved_at, "Session restored from disk");
            let session = stored.session.clone();
            self.remember_if(generation, stored);
            return Ok(Some(session));
        }

        let Some(refresh_token) = stored.refresh_token else {
            debug!("Persisted session expired");
            self.forget_if(generation);
            return Ok(None);
        };

        match self.refresh_with(&refresh_token).await {
            Ok(fresh) => {
                let session = fresh.session.clone();
                if self.remember_if(generation, fresh) {
                    info!("Expired session renewed with refresh token");
                }
                Ok(Some(session))
            }
            Err(ProviderError::Rejected(reason)) => {
                debug!(reason = %reason, "Refresh token rejected");
                self.forget_if(generation);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in(&self, credentials: &SignInCredentials) -> Result<Session, ProviderError> {
        let body = serde_json::json!({
            "email": credentials.email(),
            "password": credentials.password(),
        });
        let stored = self.post_token("password", &body).await?;
        let session = stored.session.clone();
        self.slot.lock().pending.push(stored);
        Ok(session)
    }

    async fn sign_up(&self, registration: &Registration) -> Result<SignUpOutcome, ProviderError> {
        let mut body = serde_json::json!({
            "email": registration.credentials.email(),
            "password": registration.credentials.password(),
        });
        if let Some(ref name) = registration.full_name {
            body["data"] = serde_json::json!({ "full_name": name });
        }

        let response = self
            .client
            .post(self.url("signup"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let payload: serde_json::Value = response.json().await?;

        // Without an access token the account still needs email confirmation.
        if payload.get("access_token").is_none() {
            return Ok(SignUpOutcome::ConfirmationRequired);
        }
        let token: TokenResponse = serde_json::from_value(payload)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let stored = token.into_stored();
        let session = stored.session.clone();
        self.slot.lock().pending.push(stored);
        Ok(SignUpOutcome::SignedIn(session))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let Some(stored) = self.forget() else {
            return Ok(());
        };
        self.logout(stored.session.token()).await
    }

    fn activate(&self, session: &Session) {
        let mut slot = self.slot.lock();
        let Some(index) = slot.pending.iter().position(|p| p.session.token() == session.token()) else {
            debug!("Activated session was not issued here");
            return;
        };
        let stored = slot.pending.remove(index);
        self.store_current(&mut slot, stored);
    }

    async fn discard(&self, session: &Session) -> Result<(), ProviderError> {
        {
            let mut slot = self.slot.lock();
            slot.pending.retain(|p| p.session.token() != session.token());
            if slot.current.as_ref().map(|c| c.session.token()) == Some(session.token()) {
                self.clear_current(&mut slot);
            }
        }
        debug!("Revoking superseded session");
        self.logout(session.token()).await
    }

    /// Refresh when the current token is about to expire. A rejected refresh
    /// ends the session and is announced as [`ProviderEvent::SignedOut`].
    async fn refresh_if_due(&self) -> Result<bool, ProviderError> {
        let (generation, refresh_token) = {
            let slot = self.slot.lock();
            match slot.current.as_ref() {
                Some(stored) if stored.needs_refresh() => (slot.generation, stored.refresh_token.clone()),
                _ => return Ok(false),
            }
        };

        let result = match refresh_token {
            Some(token) => self.refresh_from(generation, &token).await,
            None => Err(ProviderError::Rejected("no refresh token".to_string())),
        };
        match result {
            Ok(session) => Ok(session.is_some()),
            Err(ProviderError::Rejected(reason)) => {
                if self.forget_if(generation) {
                    warn!(reason = %reason, "Refresh rejected, ending session");
                    let _ = self.events.send(ProviderEvent::SignedOut);
                }
                Err(ProviderError::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn auth_events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        Some(self.events.subscribe())
    }
}
