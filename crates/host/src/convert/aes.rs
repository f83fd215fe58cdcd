//! Converter that stores key values encrypted with the active [`KeyRing`] key.

use common::{error::Result, Key, SecretsError};
use tracing::debug;

use super::{KeyAccess, KeyConversionAction, KeyValueConverter};
use crate::crypto::cipher::{self, CipherError, ProtectedPayload};
use crate::crypto::KeyRing;

/// Message used whenever the ring has no usable key.
pub const MISSING_KEY_CONFIGURATION: &str = "missing key configuration";

impl From<CipherError> for SecretsError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::InvalidFormat(_) => SecretsError::CryptographicFormat(e.to_string()),
            CipherError::AeadFailure => SecretsError::Crypto(e.to_string()),
            CipherError::InvalidKeyLength => SecretsError::Configuration(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AesCryptoKeyValueConverter {
    access: KeyAccess,
    ring: KeyRing,
}

impl AesCryptoKeyValueConverter {
    pub fn new(access: KeyAccess, ring: KeyRing) -> Self {
        Self { access, ring }
    }
}

impl KeyValueConverter for AesCryptoKeyValueConverter {
    fn access(&self) -> KeyAccess {
        self.access
    }

    fn read_value(&self, key: &Key) -> Result<String> {
        self.access.validate(KeyConversionAction::Read)?;

        if !key.is_encrypted {
            return Ok(key.value.clone());
        }

        let payload = ProtectedPayload::from_str(&key.value)?;
        let ring_key = self.ring.find(payload.key_id).ok_or_else(|| {
            if self.ring.is_enabled() {
                SecretsError::Configuration(format!(
                    "no encryption key with id {} is configured",
                    payload.key_id
                ))
            } else {
                SecretsError::Configuration(MISSING_KEY_CONFIGURATION.into())
            }
        })?;

        let plaintext = cipher::decrypt(&payload, ring_key.key.as_slice())?;
        String::from_utf8(plaintext)
            .map_err(|_| SecretsError::Crypto("decrypted value is not valid UTF-8".into()))
    }

    fn write_value(&self, key: &Key) -> Result<Key> {
        self.access.validate(KeyConversionAction::Write)?;

        let active = self
            .ring
            .active()
            .ok_or_else(|| SecretsError::Configuration(MISSING_KEY_CONFIGURATION.into()))?;

        let encoded = cipher::encrypt(key.value.as_bytes(), active.key.as_slice(), active.id)?
            .to_string_repr();

        // The id comes back out of the payload itself, the same way a reader
        // will see it later.
        let key_id = cipher::key_id_from_payload(&encoded)?;
        debug!(key = %key.name, key_id = %key_id, "encrypted key value");

        Ok(Key {
            name: key.name.clone(),
            value: encoded,
            is_encrypted: true,
            encryption_key_id: Some(key_id.to_string()),
            is_stale: false,
        })
    }
}
