//! Short-lived script access tokens: HS256 JWTs signed with the host's
//! signing key and accepted only by this host.

use std::fmt;

use common::{error::Result, SecretsError};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Issuer and audience of every script token.
pub const TOKEN_ISSUER: &str = "functions-host";

/// Seconds a freshly issued token stays valid.
pub const TOKEN_LIFETIME_SECS: u64 = 30;

/// HMAC key used to sign script tokens. Zeroed on drop.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Parse a hex-encoded signing key.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Configuration`] if the text is not hex or
    /// decodes to nothing.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| SecretsError::Configuration(format!("signing key is not valid hex: {e}")))?;
        if bytes.is_empty() {
            return Err(SecretsError::Configuration("signing key is empty".into()));
        }
        Ok(Self(bytes))
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTokenClaims {
    pub iss: String,
    pub aud: String,
    pub nbf: u64,
    pub iat: u64,
    pub exp: u64,
}

impl ScriptTokenClaims {
    fn issued_at(now: u64) -> Self {
        Self {
            iss: TOKEN_ISSUER.into(),
            aud: TOKEN_ISSUER.into(),
            nbf: now,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        }
    }
}

/// Issue a token valid for [`TOKEN_LIFETIME_SECS`].
pub fn create_script_token(key: &SigningKey) -> Result<String> {
    encode_claims(key, &ScriptTokenClaims::issued_at(jsonwebtoken::get_current_timestamp()))
}

/// Check signature, issuer, audience, and validity window.
///
/// # Errors
///
/// Returns [`SecretsError::Crypto`] for any token that does not verify.
pub fn validate_script_token(token: &str, key: &SigningKey) -> Result<ScriptTokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.set_audience(&[TOKEN_ISSUER]);
    validation.validate_nbf = true;
    validation.leeway = 0;

    jsonwebtoken::decode::<ScriptTokenClaims>(token, &DecodingKey::from_secret(&key.0), &validation)
        .map(|data| data.claims)
        .map_err(|e| SecretsError::Crypto(format!("invalid script token: {e}")))
}

fn encode_claims(key: &SigningKey, claims: &ScriptTokenClaims) -> Result<String> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(&key.0),
    )
    .map_err(|e| SecretsError::Crypto(format!("failed to sign script token: {e}")))
}
