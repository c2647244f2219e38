//! StockHub session core.
//!
//! Owns the client's notion of who is signed in and everything that depends
//! on it:
//! - `auth`: the `SessionStore` and the identity provider it talks to
//! - `gate`: what the UI may render for a session state
//! - `router`: fragment-based page routing that follows the session
//! - `api`: the `RequestGateway` that authenticates backend calls
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod gate;
pub mod router;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, RequestGateway, Stamped};
pub use auth::{SessionState, SessionStore};
pub use config::Config;
pub use gate::{decide, RenderMode};
pub use router::{Page, Route, RouteView, Router};
