//! Gateway for every call to the inventory API.
//!
//! Each request reads one session snapshot: the bearer token (if any) and
//! the epoch it belongs to. An unauthorized answer signs the session out
//! (once, however many requests fail together) and is still returned to
//! the caller. Nothing is retried.

use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{Epoch, SessionState, SessionStore};
use crate::config::Config;

/// A response value tagged with the epoch its request was sent under.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub epoch: Epoch,
}

impl<T> Stamped<T> {
    /// Whether the session that sent the request is still the current one.
    pub fn is_current(&self, store: &SessionStore) -> bool {
        store.is_current(self.epoch)
    }

    /// The value, or `None` if the session changed since the request went out.
    pub fn into_current(self, store: &SessionStore) -> Option<T> {
        if self.is_current(store) {
            Some(self.value)
        } else {
            debug!(epoch = %self.epoch, "Discarding response from a previous session");
            None
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Clone is cheap: reqwest::Client and SessionStore are both shared handles.
#[derive(Clone)]
pub struct RequestGateway {
    client: Client,
    base_url: String,
    store: SessionStore,
}

impl RequestGateway {
    pub fn new(store: SessionStore, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
        })
    }

    pub fn from_config(store: SessionStore, config: &Config) -> Result<Self> {
        Self::new(store, &config.api_url, config.request_timeout())
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(state: &SessionState) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = state.token() {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::InvalidRequest(format!("Unusable bearer token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    // ===== Typed helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Stamped<T>, ApiError> {
        self.execute(self.client.request(Method::GET, self.url(path))).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Stamped<T>, ApiError> {
        self.execute(self.client.request(Method::POST, self.url(path)).json(body))
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Stamped<T>, ApiError> {
        self.execute(self.client.request(Method::PUT, self.url(path)).json(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<Stamped<T>, ApiError> {
        self.execute(self.client.request(Method::DELETE, self.url(path))).await
    }

    /// Untyped request for callers that only relay JSON.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Stamped<serde_json::Value>, ApiError> {
        let mut request = self.client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request).await
    }

    // ===== Core =====

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Stamped<T>, ApiError> {
        let (state, epoch) = self.store.snapshot();
        let request = request.headers(Self::auth_headers(&state)?);
        drop(state);

        let response = request.send().await?;
        let status = response.status();
        let url = response.url().to_string();
        debug!(url = %url, status = status.as_u16(), epoch = %epoch, "API response");

        if status == StatusCode::UNAUTHORIZED {
            if self.store.force_sign_out(epoch).await {
                warn!(url = %url, epoch = %epoch, "Unauthorized response, session signed out");
            }
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let bytes = response.bytes().await?;
        // Empty bodies (204, bare DELETE) decode as JSON null.
        let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        let value = serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))?;

        Ok(Stamped { value, epoch })
    }
}
