//! # TaskPulse Realtime
//!
//! The fan-out hub with its connection registry and subscription indices,
//! the WebSocket and SSE transports, the HTTP read API, the dashboard
//! composite, and the composition root that wires the whole system
//! together.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod dashboard;
pub mod hub;

pub use auth::{AuthClaims, NullTokenValidator, TokenValidator};
pub use bootstrap::{AppHandle, Bootstrap};
pub use hub::FanoutHub;
