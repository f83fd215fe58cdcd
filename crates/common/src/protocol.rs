//! Result types returned by the secret manager and the request/response bodies
//! of the admin HTTP surface.
//!
//! Everything here is serialised as JSON.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Secret manager results
// ---------------------------------------------------------------------------

/// Outcome of an add-or-update style mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Created,
    Updated,
}

/// The secret value written by a mutation together with its outcome.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyOperationResult {
    pub secret: String,
    pub result: OperationResult,
}

impl KeyOperationResult {
    pub fn new(secret: impl Into<String>, result: OperationResult) -> Self {
        Self {
            secret: secret.into(),
            result,
        }
    }
}

impl fmt::Debug for KeyOperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyOperationResult")
            .field("secret", &"[REDACTED]")
            .field("result", &self.result)
            .finish()
    }
}

/// Plaintext-resolved host secrets as handed to callers.
#[derive(Clone, PartialEq, Eq)]
pub struct HostSecretsInfo {
    pub master_key: String,
    pub function_keys: HashMap<String, String>,
}

impl fmt::Debug for HostSecretsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.function_keys.keys().collect();
        names.sort();
        f.debug_struct("HostSecretsInfo")
            .field("master_key", &"[REDACTED]")
            .field("function_keys", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Admin API
// ---------------------------------------------------------------------------

/// Request body for the `PUT` key endpoints. A missing value asks the host to
/// generate one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretValueRequest {
    #[serde(default)]
    pub value: Option<String>,
}

/// A single key as exposed by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponse {
    pub name: String,
    pub value: String,
}

/// A list of keys, sorted by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Vec<KeyResponse>,
}

impl KeysResponse {
    /// Build a name-sorted response from a name → value map.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut keys: Vec<KeyResponse> = map
            .iter()
            .map(|(name, value)| KeyResponse {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Self { keys }
    }
}

/// Response body for `POST /admin/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"invalid_argument"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether host secrets are currently resolved in memory.
    pub host_secrets_loaded: bool,
    /// Number of functions with cached secrets.
    pub cached_functions: usize,
}
