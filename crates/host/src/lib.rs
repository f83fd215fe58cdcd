//! Secret management for a serverless function host.
//!
//! - [`convert`]: key value converters (plaintext and AES-GCM-SIV at rest).
//! - [`repository`]: durable storage of secrets documents with change
//!   notification.
//! - [`serializer`]: JSON form of host and function documents.
//! - [`manager`]: the [`manager::SecretManager`] that resolves, generates,
//!   rotates, and invalidates secrets.
//! - [`server`]: health check and admin HTTP surface.

pub mod config;
pub mod convert;
pub mod crypto;
pub mod manager;
pub mod repository;
pub mod serializer;
pub mod server;
pub mod telemetry;
pub mod token;
