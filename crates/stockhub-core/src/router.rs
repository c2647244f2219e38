//! Client-side routing over the URL fragment.
//!
//! The page shown is always `resolve(route, state)`: a pure function of the
//! fragment and the latest session state. Session transitions only ever
//! rewrite the fragment (sign-in jumps to the dashboard, sign-out leaves
//! it) and the page is recomputed from there.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::auth::{SessionEvent, SessionState, SessionStore, Subscription, TransitionCause};

/// Logical page the shell renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Landing,
    SignIn,
    SignUp,
    Dashboard,
}

impl Page {
    /// Route that leads to this page.
    pub fn route(self) -> Route {
        match self {
            Page::Landing => Route::Root,
            Page::SignIn => Route::SignIn,
            Page::SignUp => Route::SignUp,
            Page::Dashboard => Route::Dashboard,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Page::Landing => "Home",
            Page::SignIn => "Sign in",
            Page::SignUp => "Sign up",
            Page::Dashboard => "Dashboard",
        }
    }

    /// Parse a page name typed by the user (`home`, `signin`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "" | "home" | "landing" => Some(Page::Landing),
            "signin" | "sign-in" | "login" => Some(Page::SignIn),
            "signup" | "sign-up" | "register" => Some(Page::SignUp),
            "dashboard" => Some(Page::Dashboard),
            _ => None,
        }
    }
}

/// A legal URL fragment. Anything unrecognised is [`Route::Root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Root,
    SignIn,
    SignUp,
    Dashboard,
}

impl Route {
    pub fn parse(fragment: &str) -> Self {
        match fragment.trim().trim_start_matches('#') {
            "signin" => Route::SignIn,
            "signup" => Route::SignUp,
            "dashboard" => Route::Dashboard,
            _ => Route::Root,
        }
    }

    /// Fragment text without the leading `#`.
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Root => "",
            Route::SignIn => "signin",
            Route::SignUp => "signup",
            Route::Dashboard => "dashboard",
        }
    }
}

/// The routing rule table.
pub fn resolve(route: Route, state: &SessionState) -> Page {
    match route {
        Route::Root => Page::Landing,
        Route::SignIn => Page::SignIn,
        Route::SignUp => Page::SignUp,
        Route::Dashboard if state.is_authenticated() => Page::Dashboard,
        Route::Dashboard => Page::SignIn,
    }
}

/// Current fragment and the page derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteView {
    pub route: Route,
    pub page: Page,
}

impl RouteView {
    pub fn derive(route: Route, state: &SessionState) -> Self {
        Self {
            route,
            page: resolve(route, state),
        }
    }

    pub fn fragment(&self) -> &'static str {
        self.route.as_str()
    }
}

/// Route after a session transition, given the view before it.
fn route_after(current: RouteView, event: &SessionEvent) -> Route {
    match (&event.state, event.cause) {
        (SessionState::Authenticated(_), TransitionCause::SignedIn | TransitionCause::Restored) => {
            Route::Dashboard
        }
        (SessionState::Anonymous, TransitionCause::ForcedSignOut) if current.page == Page::Dashboard => {
            Route::SignIn
        }
        (SessionState::Anonymous, _) if current.page == Page::Dashboard => Route::Root,
        _ => current.route,
    }
}

struct RouterState {
    view: Mutex<RouteView>,
    updates: watch::Sender<RouteView>,
}

impl RouterState {
    fn commit(&self, view: &mut RouteView, next: RouteView) {
        if *view != next {
            debug!(from = ?view.page, to = ?next.page, fragment = next.fragment(), "Route changed");
        }
        *view = next;
        self.updates.send_replace(next);
    }
}

/// Keeps the page in line with the fragment and the session.
///
/// Dropping the router deregisters it from the store.
pub struct Router {
    store: SessionStore,
    state: Arc<RouterState>,
    _subscription: Subscription,
}

impl Router {
    pub fn new(store: SessionStore, initial_fragment: &str) -> Self {
        let route = Route::parse(initial_fragment);
        let placeholder = RouteView::derive(route, &SessionState::Uninitialized);
        let (updates, _) = watch::channel(placeholder);
        let state = Arc::new(RouterState {
            view: Mutex::new(placeholder),
            updates,
        });

        let seed_state = Arc::clone(&state);
        let listener_state = Arc::clone(&state);
        let subscription = store.subscribe_with(
            move |session| {
                let mut view = seed_state.view.lock();
                seed_state.commit(&mut view, RouteView::derive(route, session));
            },
            move |event| {
                let mut view = listener_state.view.lock();
                let next = RouteView::derive(route_after(*view, event), &event.state);
                listener_state.commit(&mut view, next);
            },
        );

        Self {
            store,
            state,
            _subscription: subscription,
        }
    }

    pub fn view(&self) -> RouteView {
        *self.state.view.lock()
    }

    pub fn page(&self) -> Page {
        self.view().page
    }

    pub fn fragment(&self) -> &'static str {
        self.view().fragment()
    }

    /// Receiver that sees every committed route.
    pub fn watch(&self) -> watch::Receiver<RouteView> {
        self.state.updates.subscribe()
    }

    /// The fragment changed underneath us (user edited the URL, bookmark, back button).
    pub fn on_fragment_change(&self, fragment: &str) -> RouteView {
        self.set_route(Route::parse(fragment))
    }

    /// Move to `page` on behalf of a UI action. The dashboard is only
    /// reachable while signed in; otherwise this lands on sign-in.
    pub fn navigate(&self, page: Page) -> RouteView {
        let mut view = self.state.view.lock();
        let session = self.store.state();
        let route = match page {
            Page::Dashboard if !session.is_authenticated() => Route::SignIn,
            other => other.route(),
        };
        let next = RouteView::derive(route, &session);
        self.state.commit(&mut view, next);
        next
    }

    fn set_route(&self, route: Route) -> RouteView {
        // Read the session under the view lock so the page reflects the
        // latest state even if a transition lands concurrently.
        let mut view = self.state.view.lock();
        let next = RouteView::derive(route, &self.store.state());
        self.state.commit(&mut view, next);
        next
    }
}
