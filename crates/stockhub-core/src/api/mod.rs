//! Request layer for the StockHub inventory API.
//!
//! This module provides the `RequestGateway`, through which every backend
//! call goes. It attaches the current bearer token and turns
//! unauthorized responses into a global sign-out.

pub mod error;
pub mod gateway;

pub use error::ApiError;
pub use gateway::{RequestGateway, Stamped};
