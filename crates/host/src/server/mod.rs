//! Axum HTTP server: health check and the admin surface over the secret
//! manager.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Authorise admin routes against the host master key.
//! - Inject shared application state (`AppState`) into handlers.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
