//! Configuration loading and validation for the functions host.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::KeyRing;
use crate::token::SigningKey;

/// Validated host configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Directory holding `host.json` and one document per function. **Required.**
    pub secrets_path: String,

    /// Root of the function scripts; one sub-directory per function. **Required.**
    pub script_path: String,

    /// Port the admin HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint of the collector. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Hex key material for encrypting secrets at rest. Plaintext when unset.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Comma-separated hex key material of retired encryption keys, kept so
    /// values written before a rotation stay readable.
    #[serde(default)]
    pub previous_encryption_keys: Option<String>,

    /// Hex HMAC key for script access tokens. Token issuance is disabled when unset.
    #[serde(default)]
    pub signing_key: Option<String>,

    /// How often (milliseconds) the secrets directory is polled for changes.
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,

    /// How often (seconds) orphaned function secrets are purged.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Serve admin routes without checking the master key.
    #[serde(default)]
    pub auth_disabled: bool,

    /// Generate host secrets at startup instead of on first request.
    #[serde(default = "default_create_host_secrets")]
    pub create_host_secrets_if_missing: bool,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_watch_interval() -> u64 {
    1000
}
fn default_purge_interval() -> u64 {
    3600
}
fn default_create_host_secrets() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.secrets_path, "SECRETS_PATH")?;
        ensure_non_empty(&self.script_path, "SCRIPT_PATH")?;

        if self.watch_interval_ms == 0 {
            anyhow::bail!("WATCH_INTERVAL_MS must be > 0");
        }
        if self.purge_interval_secs == 0 {
            anyhow::bail!("PURGE_INTERVAL_SECS must be > 0");
        }
        if !self.previous_encryption_keys().is_empty() && non_blank(&self.encryption_key).is_none() {
            anyhow::bail!("PREVIOUS_ENCRYPTION_KEYS requires ENCRYPTION_KEY");
        }
        self.key_ring().context("ENCRYPTION_KEY is invalid")?;
        self.signing_key().context("SIGNING_KEY is invalid")?;
        Ok(())
    }

    /// Retired key material, in configured order, with blanks skipped.
    pub fn previous_encryption_keys(&self) -> Vec<String> {
        self.previous_encryption_keys
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Key ring built from the configured key material.
    pub fn key_ring(&self) -> Result<KeyRing> {
        let ring = KeyRing::from_hex(
            non_blank(&self.encryption_key),
            &self.previous_encryption_keys(),
        )?;
        Ok(ring)
    }

    pub fn signing_key(&self) -> Result<Option<SigningKey>> {
        match non_blank(&self.signing_key) {
            Some(hex) => Ok(Some(SigningKey::from_hex(hex)?)),
            None => Ok(None),
        }
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        non_blank(&self.otel_exporter_otlp_endpoint)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("secrets_path", &self.secrets_path)
            .field("script_path", &self.script_path)
            .field("listen_port", &self.listen_port)
            .field("log_level", &self.log_level)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("encryption_key", &redacted(&self.encryption_key))
            .field("previous_encryption_keys", &redacted(&self.previous_encryption_keys))
            .field("signing_key", &redacted(&self.signing_key))
            .field("watch_interval_ms", &self.watch_interval_ms)
            .field("purge_interval_secs", &self.purge_interval_secs)
            .field("auth_disabled", &self.auth_disabled)
            .field("create_host_secrets_if_missing", &self.create_host_secrets_if_missing)
            .finish()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
