//! Render gating: what the UI may show for a given session state.

use crate::auth::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    ShowLoadingIndicator,
    ShowLoginForm,
    ShowProtectedContent,
}

/// Decide what to render. Pure; call it again on every state change.
pub fn decide(state: &SessionState) -> RenderMode {
    match state {
        SessionState::Uninitialized | SessionState::Loading => RenderMode::ShowLoadingIndicator,
        SessionState::Anonymous => RenderMode::ShowLoginForm,
        SessionState::Authenticated(_) => RenderMode::ShowProtectedContent,
    }
}
