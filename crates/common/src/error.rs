//! Common error types shared across crates.

use thiserror::Error;

/// Error type for every secret-management operation.
///
/// Variants map to HTTP status codes returned by the admin surface:
/// - [`SecretsError::InvalidArgument`] → 400
/// - everything else, including a corrupt persisted document, → 500
#[derive(Debug, Error)]
pub enum SecretsError {
    /// A required argument was empty or otherwise unusable (e.g. a blank function name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A key value converter was used outside the access mode it was built with.
    #[error("access violation: {0}")]
    AccessViolation(String),

    /// Ciphertext is too short or malformed to carry encryption metadata.
    #[error("invalid cryptographic payload: {0}")]
    CryptographicFormat(String),

    /// Encryption or decryption failed (wrong key, tampered data).
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// Encryption was requested but the required key material is not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A persisted secrets document is not valid for its declared type.
    #[error("format error: {0}")]
    Format(String),

    /// The backing store failed to read, write, or delete a document.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecretsError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            SecretsError::InvalidArgument(_) => 400,
            _ => 500,
        }
    }

    /// Short machine-readable code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SecretsError::InvalidArgument(_) => "invalid_argument",
            SecretsError::AccessViolation(_) => "access_violation",
            SecretsError::CryptographicFormat(_) => "cryptographic_format",
            SecretsError::Crypto(_) => "crypto_failure",
            SecretsError::Configuration(_) => "configuration_error",
            SecretsError::Format(_) => "format_error",
            SecretsError::Io(_) => "io_error",
        }
    }
}

impl From<serde_json::Error> for SecretsError {
    fn from(e: serde_json::Error) -> Self {
        SecretsError::Format(e.to_string())
    }
}

/// Convenience alias used throughout the secrets stack.
pub type Result<T> = std::result::Result<T, SecretsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(SecretsError::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(SecretsError::Format("x".into()).http_status(), 500);
        assert_eq!(SecretsError::AccessViolation("x".into()).http_status(), 500);
        assert_eq!(SecretsError::Configuration("x".into()).http_status(), 500);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(SecretsError::from(io).http_status(), 500);
    }

    #[test]
    fn display_includes_message() {
        let e = SecretsError::InvalidArgument("function name must not be empty".into());
        assert!(e.to_string().contains("function name must not be empty"));
    }

    #[test]
    fn json_errors_become_format_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e = SecretsError::from(err);
        assert!(matches!(e, SecretsError::Format(_)));
        assert_eq!(e.code(), "format_error");
    }
}
