//! Scriptable identity provider and fixtures shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::auth::{
    Credential, Identity, IdentityProvider, ProviderError, ProviderEvent, Registration, Session,
    SignInCredentials, SignUpOutcome,
};

/// Session for a fixed test user carrying `token`.
pub(crate) fn session(token: &str) -> Session {
    Session::new(
        Identity {
            id: "user-1".to_string(),
            email: "ada@example.com".to_string(),
            metadata: Default::default(),
        },
        Credential::new(token, None),
    )
}

/// How `persisted_session()` behaves.
pub(crate) enum Restore {
    Nothing,
    Session(Session),
    Delayed(Duration, Session),
    Fail(ProviderError),
    /// Never resolves.
    Hang,
}

pub(crate) struct FakeProvider {
    restore: Mutex<Restore>,
    sign_in_result: Mutex<Result<Session, ProviderError>>,
    sign_in_delay: Option<Duration>,
    sign_up_result: Mutex<Result<SignUpOutcome, ProviderError>>,
    events: broadcast::Sender<ProviderEvent>,
    persisted_calls: AtomicUsize,
    sign_in_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    activated: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            restore: Mutex::new(Restore::Nothing),
            sign_in_result: Mutex::new(Err(ProviderError::Rejected("no account".into()))),
            sign_in_delay: None,
            sign_up_result: Mutex::new(Ok(SignUpOutcome::ConfirmationRequired)),
            events,
            persisted_calls: AtomicUsize::new(0),
            sign_in_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            activated: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_restore(self, restore: Restore) -> Self {
        *self.restore.lock() = restore;
        self
    }

    pub(crate) fn with_sign_in_result(self, result: Result<Session, ProviderError>) -> Self {
        *self.sign_in_result.lock() = result;
        self
    }

    pub(crate) fn with_sign_in_delay(mut self, delay: Duration) -> Self {
        self.sign_in_delay = Some(delay);
        self
    }

    pub(crate) fn with_sign_up_result(self, result: Result<SignUpOutcome, ProviderError>) -> Self {
        *self.sign_up_result.lock() = result;
        self
    }

    pub(crate) fn push(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn persisted_calls(&self) -> usize {
        self.persisted_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Tokens passed to `activate`, in call order.
    pub(crate) fn activated(&self) -> Vec<String> {
        self.activated.lock().clone()
    }

    /// Tokens passed to `discard`, in call order.
    pub(crate) fn discarded(&self) -> Vec<String> {
        self.discarded.lock().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn persisted_session(&self) -> Result<Option<Session>, ProviderError> {
        self.persisted_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, hang, result) = {
            let restore = self.restore.lock();
            match &*restore {
                Restore::Nothing => (None, false, Ok(None)),
                Restore::Session(s) => (None, false, Ok(Some(s.clone()))),
                Restore::Delayed(d, s) => (Some(*d), false, Ok(Some(s.clone()))),
                Restore::Fail(e) => (None, false, Err(e.clone())),
                Restore::Hang => (None, true, Ok(None)),
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn sign_in(&self, _credentials: &SignInCredentials) -> Result<Session, ProviderError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.sign_in_delay {
            tokio::time::sleep(delay).await;
        }
        self.sign_in_result.lock().clone()
    }

    async fn sign_up(&self, _registration: &Registration) -> Result<SignUpOutcome, ProviderError> {
        self.sign_up_result.lock().clone()
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn activate(&self, session: &Session) {
        self.activated.lock().push(session.token().to_string());
    }

    async fn discard(&self, session: &Session) -> Result<(), ProviderError> {
        self.discarded.lock().push(session.token().to_string());
        Ok(())
    }

    async fn refresh_if_due(&self) -> Result<bool, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn auth_events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        Some(self.events.subscribe())
    }
}
