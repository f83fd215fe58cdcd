//! Logging and tracing setup.
//!
//! Structured JSON logs always go to stdout. When an OTLP endpoint is
//! configured, spans are additionally exported to the collector over gRPC.
//!
//! # Telemetry invariants
//!
//! - **No secret values or key material** may appear in any span attribute or
//!   log field. Key names, function names, and key ids are fine.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`), overridden by
//!   `RUST_LOG` when set.

pub mod init;

pub use init::init_telemetry;
