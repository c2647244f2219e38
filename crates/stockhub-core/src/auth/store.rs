//! The session store: sole owner of [`SessionState`] and arbiter of [`Epoch`].
//!
//! One store is built at startup and handed to every component that needs
//! it. Cloning a `SessionStore` is cheap and yields a handle to the same
//! state.
//!
//! Transitions are serialized: the state is committed and then every
//! subscriber is notified, in registration order, before the next
//! transition can start. Listeners run outside the state lock so they may
//! read the store, but they must not start a transition synchronously
//! (spawn a task for that).

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AuthError, Epoch, IdentityProvider, ProviderEvent, Registration, Session, SessionEvent,
    SessionState, SignInCredentials, SignUpOutcome, TransitionCause,
};

/// How long `initialize()` waits for the provider before giving up.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Inner {
    state: SessionState,
    epoch: Epoch,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

struct Shared {
    provider: Arc<dyn IdentityProvider>,
    init_timeout: Duration,
    inner: Mutex<Inner>,
    listeners: Mutex<Listeners>,
    // Held across commit + notify so notification sets never interleave.
    transition: Mutex<()>,
}

/// A state change proposed to [`SessionStore::transition`].
struct Transition {
    state: SessionState,
    bump_epoch: bool,
    cause: TransitionCause,
}

#[derive(Clone)]
pub struct SessionStore {
    shared: Arc<Shared>,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self::with_init_timeout(provider, DEFAULT_INIT_TIMEOUT)
    }

    pub fn with_init_timeout(provider: Arc<dyn IdentityProvider>, init_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                init_timeout,
                inner: Mutex::new(Inner {
                    state: SessionState::Uninitialized,
                    epoch: Epoch::ZERO,
                }),
                listeners: Mutex::new(Listeners::default()),
                transition: Mutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state.clone()
    }

    pub fn epoch(&self) -> Epoch {
        self.shared.inner.lock().epoch
    }

    /// State and epoch read together.
    pub fn snapshot(&self) -> (SessionState, Epoch) {
        let inner = self.shared.inner.lock();
        (inner.state.clone(), inner.epoch)
    }

    /// Whether a result stamped with `epoch` still belongs to the current session.
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch() == epoch
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register `listener` for every committed transition.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or disposed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Hand the current state to `init`, then register `listener`, with no
    /// transition able to land in between. Must not be called from a
    /// listener.
    pub fn subscribe_with<I, F>(&self, init: I, listener: F) -> Subscription
    where
        I: FnOnce(&SessionState),
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let _serial = self.shared.transition.lock();
        init(&self.state());
        self.subscribe(listener)
    }

    fn notify(&self, event: &SessionEvent) {
        // Snapshot so listeners can subscribe or dispose while being called.
        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(epoch = %event.epoch, cause = ?event.cause, "Session listener panicked");
            }
        }
    }

    /// Atomically decide and commit a transition, then notify subscribers.
    ///
    /// `decide` sees the current state under the lock; returning `None`
    /// leaves everything untouched and notifies nobody.
    fn transition<F>(&self, decide: F) -> Option<SessionEvent>
    where
        F: FnOnce(&Inner) -> Option<Transition>,
    {
        let _serial = self.shared.transition.lock();

        let event = {
            let mut inner = self.shared.inner.lock();
            let next = decide(&inner)?;
            if next.bump_epoch {
                inner.epoch = inner.epoch.next();
            }
            inner.state = next.state;
            SessionEvent {
                state: inner.state.clone(),
                epoch: inner.epoch,
                cause: next.cause,
            }
        };

        info!(
            state = event.state.label(),
            epoch = %event.epoch,
            cause = ?event.cause,
            "Session transition"
        );
        self.notify(&event);
        Some(event)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore a persisted session, at most once per store.
    ///
    /// Moves to `Loading` immediately and settles on `Authenticated` or
    /// `Anonymous` within the configured timeout. Later calls return the
    /// current state without contacting the provider.
    pub async fn initialize(&self) -> SessionState {
        let started = self.transition(|inner| {
            matches!(inner.state, SessionState::Uninitialized).then_some(Transition {
                state: SessionState::Loading,
                bump_epoch: false,
                cause: TransitionCause::Loading,
            })
        });
        let Some(started) = started else {
            debug!("Session store already initialized");
            return self.state();
        };

        let lookup = tokio::time::timeout(
            self.shared.init_timeout,
            self.shared.provider.persisted_session(),
        )
        .await;

        let restored = match lookup {
            Ok(Ok(Some(session))) => Some(session),
            Ok(Ok(None)) => {
                info!("No persisted session");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to restore session");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.shared.init_timeout.as_millis() as u64,
                    "Timed out restoring session"
                );
                None
            }
        };

        let committed = self.transition(|inner| {
            // A sign-in or sign-out while we waited wins over the restore.
            if inner.epoch != started.epoch || !matches!(inner.state, SessionState::Loading) {
                return None;
            }
            Some(match restored.clone() {
                Some(session) => Transition {
                    state: SessionState::Authenticated(session),
                    bump_epoch: true,
                    cause: TransitionCause::Restored,
                },
                None => Transition {
                    state: SessionState::Anonymous,
                    bump_epoch: false,
                    cause: TransitionCause::RestoreFailed,
                },
            })
        });
        if committed.is_none() {
            debug!(started_at = %started.epoch, "Discarding stale restore result");
            if let Some(session) = restored {
                self.discard(&session).await;
            }
        }

        self.state()
    }

    // =========================================================================
    // Sign-in / sign-up
    // =========================================================================

    pub async fn sign_in(&self, credentials: &SignInCredentials) -> Result<Session, AuthError> {
        let started_at = self.epoch();
        let session = self
            .shared
            .provider
            .sign_in(credentials)
            .await
            .inspect_err(|e| warn!(error = %e, "Sign-in failed"))?;
        self.commit_session(started_at, session).await
    }

    /// Validate raw form input, then [`sign_in`](Self::sign_in).
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let credentials = SignInCredentials::new(email, password)?;
        self.sign_in(&credentials).await
    }

    pub async fn sign_up(&self, registration: &Registration) -> Result<SignUpOutcome, AuthError> {
        let started_at = self.epoch();
        let outcome = self
            .shared
            .provider
            .sign_up(registration)
            .await
            .inspect_err(|e| warn!(error = %e, "Sign-up failed"))?;
        match outcome {
            SignUpOutcome::SignedIn(session) => {
                let session = self.commit_session(started_at, session).await?;
                Ok(SignUpOutcome::SignedIn(session))
            }
            SignUpOutcome::ConfirmationRequired => {
                info!("Sign-up requires email confirmation");
                Ok(SignUpOutcome::ConfirmationRequired)
            }
        }
    }

    async fn commit_session(&self, started_at: Epoch, session: Session) -> Result<Session, AuthError> {
        let committed = self.transition(|inner| {
            if inner.epoch != started_at {
                return None;
            }
            // Still under the transition lock, so activations keep commit order.
            self.shared.provider.activate(&session);
            Some(Transition {
                state: SessionState::Authenticated(session.clone()),
                bump_epoch: true,
                cause: TransitionCause::SignedIn,
            })
        });
        if committed.is_some() {
            return Ok(session);
        }

        debug!(started_at = %started_at, "Discarding stale sign-in result");
        self.discard(&session).await;
        Err(AuthError::Superseded)
    }

    async fn discard(&self, session: &Session) {
        if let Err(e) = self.shared.provider.discard(session).await {
            warn!(error = %e, "Failed to discard superseded provider session");
        }
    }

    // =========================================================================
    // Sign-out
    // =========================================================================

    /// User-initiated sign-out. Returns whether a transition happened;
    /// calling it while already `Anonymous` does nothing.
    pub async fn sign_out(&self) -> bool {
        let event = self.transition(|inner| {
            (!matches!(inner.state, SessionState::Anonymous)).then_some(Transition {
                state: SessionState::Anonymous,
                bump_epoch: true,
                cause: TransitionCause::SignedOut,
            })
        });
        if event.is_none() {
            debug!("Sign-out ignored, already anonymous");
            return false;
        }
        self.provider_sign_out().await;
        true
    }

    /// Sign-out triggered by an unauthorized response to a request sent
    /// under `epoch`. Only acts while that epoch's session is still active,
    /// so late responses from an older session change nothing.
    pub async fn force_sign_out(&self, epoch: Epoch) -> bool {
        let event = self.transition(|inner| {
            (inner.epoch == epoch && inner.state.is_authenticated()).then_some(Transition {
                state: SessionState::Anonymous,
                bump_epoch: true,
                cause: TransitionCause::ForcedSignOut,
            })
        });
        if event.is_none() {
            debug!(request_epoch = %epoch, "Forced sign-out ignored, session already changed");
            return false;
        }
        self.provider_sign_out().await;
        true
    }

    async fn provider_sign_out(&self) {
        if let Err(e) = self.shared.provider.sign_out().await {
            warn!(error = %e, "Identity provider sign-out failed");
        }
    }

    /// Ask the provider to renew the credential if it is about to expire.
    /// The renewed session comes back through the provider's change channel.
    pub async fn refresh_if_due(&self) -> bool {
        if !self.state().is_authenticated() {
            return false;
        }
        match self.shared.provider.refresh_if_due().await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, "Credential refresh failed");
                false
            }
        }
    }

    // =========================================================================
    // Provider push events
    // =========================================================================

    /// Apply a change pushed by the identity provider. Returns whether it
    /// produced a transition.
    pub fn apply_provider_event(&self, event: ProviderEvent) -> bool {
        let committed = match event {
            ProviderEvent::TokenRefreshed(session) => self.transition(|inner| match &inner.state {
                SessionState::Authenticated(current) if current.identity.id == session.identity.id => {
                    Some(Transition {
                        state: SessionState::Authenticated(session),
                        bump_epoch: false,
                        cause: TransitionCause::Refreshed,
                    })
                }
                _ => None,
            }),
            ProviderEvent::SignedOut => self.transition(|inner| {
                inner.state.is_authenticated().then_some(Transition {
                    state: SessionState::Anonymous,
                    bump_epoch: true,
                    cause: TransitionCause::ProviderSignedOut,
                })
            }),
        };
        if committed.is_none() {
            debug!("Provider event ignored");
        }
        committed.is_some()
    }

    /// Follow the provider's change channel until it closes.
    ///
    /// Returns `None` when the provider does not push changes.
    pub fn watch_provider(&self) -> Option<JoinHandle<()>> {
        let mut events = self.shared.provider.auth_events()?;
        let shared = Arc::downgrade(&self.shared);

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(shared) = shared.upgrade() else { break };
                        SessionStore { shared }.apply_provider_event(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed identity provider events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Identity provider event stream closed");
        }))
    }
}

/// Disposer returned by [`SessionStore::subscribe`]; deregisters on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{session, FakeProvider, Restore};
    use crate::auth::ProviderError;

    /// Collect every event a store publishes.
    fn record(store: &SessionStore) -> (Arc<Mutex<Vec<SessionEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = store.subscribe(move |event| sink.lock().push(event.clone()));
        (events, sub)
    }

    fn causes(events: &Mutex<Vec<SessionEvent>>) -> Vec<TransitionCause> {
        events.lock().iter().map(|e| e.cause).collect()
    }

    // -------------------------------------------------------------------------
    // initialize()
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initialize_restores_persisted_session() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Session(session("tok-1"))));
        let store = SessionStore::new(provider);
        let (events, _sub) = record(&store);

        let state = store.initialize().await;

        assert_eq!(state.token(), Some("tok-1"));
        assert_eq!(store.epoch().value(), 1);
        assert_eq!(causes(&events), vec![TransitionCause::Loading, TransitionCause::Restored]);
    }

    #[tokio::test]
    async fn test_initialize_without_session_is_anonymous() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        assert_eq!(store.initialize().await, SessionState::Anonymous);
        assert_eq!(store.epoch(), Epoch::ZERO);
    }

    #[tokio::test]
    async fn test_initialize_provider_error_is_anonymous() {
        let provider = FakeProvider::new()
            .with_restore(Restore::Fail(ProviderError::Network("connection refused".into())));
        let store = SessionStore::new(Arc::new(provider));
        assert_eq!(store.initialize().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Session(session("tok"))));
        let store = SessionStore::new(provider.clone());
        let (events, _sub) = record(&store);

        store.initialize().await;
        let again = store.initialize().await;

        assert!(again.is_authenticated());
        assert_eq!(provider.persisted_calls(), 1);
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_times_out_to_anonymous() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Hang));
        let store = SessionStore::new(provider);

        let task = tokio::spawn({
            let store = store.clone();
            async move { store.initialize().await }
        });

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(store.state(), SessionState::Loading);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.state(), SessionState::Anonymous);
        assert_eq!(task.await.unwrap(), SessionState::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_during_restore_wins() {
        let provider = FakeProvider::new()
            .with_restore(Restore::Delayed(Duration::from_secs(2), session("old")))
            .with_sign_in_result(Ok(session("fresh")));
        let provider = Arc::new(provider);
        let store = SessionStore::new(provider.clone());

        let init = tokio::spawn({
            let store = store.clone();
            async move { store.initialize().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(store.state(), SessionState::Loading);

        store.sign_in_with_password("ada@example.com", "pw").await.unwrap();
        let settled = init.await.unwrap();

        assert_eq!(settled.token(), Some("fresh"));
        assert_eq!(store.epoch().value(), 1);
        assert_eq!(provider.discarded(), vec!["old".to_string()]);
    }

    // -------------------------------------------------------------------------
    // sign_in / sign_up
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sign_in_commits_and_notifies_once() {
        let provider = FakeProvider::new().with_sign_in_result(Ok(session("tok")));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;
        let (events, _sub) = record(&store);

        let session = store.sign_in_with_password("ada@example.com", "pw").await.unwrap();

        assert_eq!(session.token(), "tok");
        assert!(store.state().is_authenticated());
        assert_eq!(store.epoch().value(), 1);
        assert_eq!(causes(&events), vec![TransitionCause::SignedIn]);
    }

    #[tokio::test]
    async fn test_sign_in_failure_leaves_state_alone() {
        let provider = FakeProvider::new()
            .with_sign_in_result(Err(ProviderError::Rejected("invalid_grant".into())));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;
        let (events, _sub) = record(&store);

        let err = store.sign_in_with_password("ada@example.com", "bad").await.unwrap_err();

        assert!(matches!(err, AuthError::Provider(ProviderError::Rejected(_))));
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_validation_skips_provider() {
        let provider = Arc::new(FakeProvider::new());
        let store = SessionStore::new(provider.clone());
        store.initialize().await;

        let err = store.sign_in_with_password("not-an-email", "pw").await.unwrap_err();

        assert!(matches!(err, AuthError::Validation(_)));
        assert_eq!(provider.sign_in_calls(), 0);
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_superseded_by_sign_out() {
        let provider = Arc::new(
            FakeProvider::new()
                .with_sign_in_result(Ok(session("tok")))
                .with_sign_in_delay(Duration::from_secs(1)),
        );
        let store = SessionStore::new(provider.clone());
        store.initialize().await;
        store.sign_in_with_password("ada@example.com", "pw").await.unwrap();

        let second = tokio::spawn({
            let store = store.clone();
            async move { store.sign_in_with_password("ada@example.com", "pw").await }
        });
        tokio::task::yield_now().await;
        assert!(store.sign_out().await);

        let result = second.await.unwrap();
        assert_eq!(result, Err(AuthError::Superseded));
        assert_eq!(store.state(), SessionState::Anonymous);
        assert_eq!(provider.sign_out_calls(), 1);
        assert_eq!(provider.activated(), vec!["tok".to_string()]);
        assert_eq!(provider.discarded(), vec!["tok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_superseded_by_newer_sign_in_is_discarded() {
        let provider = Arc::new(
            FakeProvider::new()
                .with_sign_in_result(Ok(session("slow")))
                .with_sign_in_delay(Duration::from_secs(1))
                .with_sign_up_result(Ok(SignUpOutcome::SignedIn(session("fast")))),
        );
        let store = SessionStore::new(provider.clone());
        store.initialize().await;

        let slow = tokio::spawn({
            let store = store.clone();
            async move { store.sign_in_with_password("ada@example.com", "pw").await }
        });
        tokio::task::yield_now().await;
        let registration = Registration::new("ada@example.com", "pw", None).unwrap();
        store.sign_up(&registration).await.unwrap();

        assert_eq!(slow.await.unwrap(), Err(AuthError::Superseded));
        assert_eq!(store.state().token(), Some("fast"));
        assert_eq!(provider.activated(), vec!["fast".to_string()]);
        assert_eq!(provider.discarded(), vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_sign_up_with_session_signs_in() {
        let provider = FakeProvider::new().with_sign_up_result(Ok(SignUpOutcome::SignedIn(session("new"))));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;

        let registration = Registration::new("ada@example.com", "pw", Some("Ada")).unwrap();
        let outcome = store.sign_up(&registration).await.unwrap();

        assert!(matches!(outcome, SignUpOutcome::SignedIn(_)));
        assert_eq!(store.state().token(), Some("new"));
    }

    #[tokio::test]
    async fn test_sign_up_requiring_confirmation_keeps_state() {
        let provider = FakeProvider::new().with_sign_up_result(Ok(SignUpOutcome::ConfirmationRequired));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;
        let (events, _sub) = record(&store);

        let registration = Registration::new("ada@example.com", "pw", None).unwrap();
        let outcome = store.sign_up(&registration).await.unwrap();

        assert_eq!(outcome, SignUpOutcome::ConfirmationRequired);
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(events.lock().is_empty());
    }

    // -------------------------------------------------------------------------
    // sign_out
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sign_out_is_idempotent() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Session(session("tok"))));
        let store = SessionStore::new(provider.clone());
        store.initialize().await;
        let (events, _sub) = record(&store);

        assert!(store.sign_out().await);
        assert!(!store.sign_out().await);

        assert_eq!(store.state(), SessionState::Anonymous);
        assert_eq!(store.epoch().value(), 2);
        assert_eq!(causes(&events), vec![TransitionCause::SignedOut]);
        assert_eq!(provider.sign_out_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sign_outs_collapse() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Session(session("tok"))));
        let store = SessionStore::new(provider.clone());
        store.initialize().await;
        let (events, _sub) = record(&store);

        let (a, b) = tokio::join!(store.sign_out(), store.sign_out());

        assert!(a ^ b);
        assert_eq!(events.lock().len(), 1);
        assert_eq!(provider.sign_out_calls(), 1);
    }

    #[tokio::test]
    async fn test_states_settle_after_each_call() {
        let provider = FakeProvider::new().with_sign_in_result(Ok(session("tok")));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;

        for _ in 0..3 {
            store.sign_in_with_password("ada@example.com", "pw").await.unwrap();
            assert!(store.state().is_authenticated());
            store.sign_out().await;
            assert_eq!(store.state(), SessionState::Anonymous);
        }
        assert_eq!(store.epoch().value(), 6);
    }

    #[tokio::test]
    async fn test_force_sign_out_ignores_stale_epoch() {
        let provider = Arc::new(FakeProvider::new().with_sign_in_result(Ok(session("tok"))));
        let store = SessionStore::new(provider.clone());
        store.initialize().await;

        store.sign_in_with_password("ada@example.com", "pw").await.unwrap();
        let first = store.epoch();
        store.sign_out().await;
        store.sign_in_with_password("ada@example.com", "pw").await.unwrap();

        assert!(!store.force_sign_out(first).await);
        assert!(store.state().is_authenticated());

        let (events, _sub) = record(&store);
        assert!(store.force_sign_out(store.epoch()).await);
        assert_eq!(causes(&events), vec![TransitionCause::ForcedSignOut]);
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                store.subscribe(move |_| order.lock().push(i))
            })
            .collect();

        store.initialize().await;

        // Two transitions: Loading, then RestoreFailed.
        assert_eq!(*order.lock(), vec![0, 1, 2, 0, 1, 2]);
        drop(subs);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        let _bad = store.subscribe(|_| panic!("listener bug"));
        let (events, _sub) = record(&store);

        assert_eq!(store.initialize().await, SessionState::Anonymous);
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_disposed_listener_is_not_called() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        let (events, sub) = record(&store);
        sub.dispose();

        store.initialize().await;
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_listener_can_read_store() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = store.subscribe({
            let store = store.clone();
            let seen = Arc::clone(&seen);
            move |event| {
                assert_eq!(store.state(), event.state);
                seen.lock().push(store.epoch());
            }
        });

        store.initialize().await;
        assert_eq!(seen.lock().len(), 2);
    }

    // -------------------------------------------------------------------------
    // Provider events
    // -------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_with_misses_no_transition() {
        let provider = FakeProvider::new().with_sign_in_result(Ok(session("tok")));
        let store = SessionStore::new(Arc::new(provider));
        store.initialize().await;

        let churn = tokio::spawn({
            let store = store.clone();
            async move {
                for _ in 0..50 {
                    store.sign_in_with_password("ada@example.com", "pw").await.unwrap();
                    store.sign_out().await;
                }
            }
        });

        let mut observers = Vec::new();
        while !churn.is_finished() {
            let seen = Arc::new(Mutex::new(None::<SessionState>));
            let first = Arc::clone(&seen);
            let latest = Arc::clone(&seen);
            let sub = store.subscribe_with(
                move |state| *first.lock() = Some(state.clone()),
                move |event| *latest.lock() = Some(event.state.clone()),
            );
            observers.push((seen, sub));
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();

        let last = store.state();
        for (seen, _sub) in &observers {
            assert_eq!(seen.lock().as_ref(), Some(&last));
        }
    }

    #[tokio::test]
    async fn test_refresh_if_due_only_while_signed_in() {
        let provider = Arc::new(FakeProvider::new().with_sign_in_result(Ok(session("tok"))));
        let store = SessionStore::new(provider.clone());
        store.initialize().await;

        assert!(!store.refresh_if_due().await);
        assert_eq!(provider.refresh_calls(), 0);

        store.sign_in_with_password("ada@example.com", "pw").await.unwrap();
        assert!(store.refresh_if_due().await);
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_token_refresh_keeps_epoch() {
        let store = SessionStore::new(Arc::new(
            FakeProvider::new().with_restore(Restore::Session(session("old"))),
        ));
        store.initialize().await;
        let epoch = store.epoch();

        assert!(store.apply_provider_event(ProviderEvent::TokenRefreshed(session("new"))));

        assert_eq!(store.state().token(), Some("new"));
        assert_eq!(store.epoch(), epoch);
    }

    #[tokio::test]
    async fn test_refresh_while_anonymous_is_ignored() {
        let store = SessionStore::new(Arc::new(FakeProvider::new()));
        store.initialize().await;

        assert!(!store.apply_provider_event(ProviderEvent::TokenRefreshed(session("new"))));
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_watch_provider_applies_sign_out() {
        let provider = Arc::new(FakeProvider::new().with_restore(Restore::Session(session("tok"))));
        let store = SessionStore::new(provider.clone());
        store.initialize().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = store.subscribe(move |event| {
            let _ = tx.send(event.cause);
        });
        let _watcher = store.watch_provider().expect("fake provider pushes events");

        provider.push(ProviderEvent::SignedOut);

        assert_eq!(rx.recv().await, Some(TransitionCause::ProviderSignedOut));
        assert_eq!(store.state(), SessionState::Anonymous);
        // The provider already ended the session; no call back into it.
        assert_eq!(provider.sign_out_calls(), 0);
    }
}
