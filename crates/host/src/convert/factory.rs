//! Selection of the converter that applies to a key, plus whole-key helpers.

use std::sync::Arc;

use common::{error::Result, Key, ScriptSecrets, SecretsError};

use super::aes::MISSING_KEY_CONFIGURATION;
use super::{
    AesCryptoKeyValueConverter, KeyAccess, KeyConversionAction, KeyValueConverter,
    PlaintextKeyValueConverter,
};
use crate::crypto::KeyRing;

/// Picks the [`KeyValueConverter`] for a key and an intended action.
///
/// This is the single seam for introducing or rotating encryption schemes.
pub trait KeyValueConverterFactory: Send + Sync + std::fmt::Debug {
    fn get_value_converter(
        &self,
        key: &Key,
        action: KeyConversionAction,
    ) -> Result<Arc<dyn KeyValueConverter>>;

    /// Whether `key`, in its persisted form, needs to be rewritten to match the
    /// active encryption settings.
    fn is_stale(&self, key: &Key) -> bool;

    /// Resolve a persisted key to its plaintext form, flagging staleness.
    fn read_key(&self, key: &Key) -> Result<Key> {
        let value = self
            .get_value_converter(key, KeyConversionAction::Read)?
            .read_value(key)?;
        let mut resolved = Key::new(key.name.clone(), value);
        resolved.is_stale = self.is_stale(key);
        Ok(resolved)
    }

    /// Produce the persisted form of a plaintext key.
    fn write_key(&self, key: &Key) -> Result<Key> {
        self.get_value_converter(key, KeyConversionAction::Write)?
            .write_value(key)
    }

    /// Resolve every key of a persisted document.
    fn read_secrets(&self, secrets: &ScriptSecrets) -> Result<ScriptSecrets> {
        let mut resolved = secrets.clone();
        for key in resolved.keys_mut() {
            *key = self.read_key(key)?;
        }
        Ok(resolved)
    }

    /// Rewrite every key of a plaintext-resolved document with the active
    /// converter.
    fn refresh(&self, secrets: &ScriptSecrets) -> Result<ScriptSecrets> {
        let mut refreshed = secrets.clone();
        for key in refreshed.keys_mut() {
            *key = self.write_key(key)?;
        }
        Ok(refreshed)
    }
}

/// Plaintext when the key ring is empty, AES otherwise.
#[derive(Debug, Clone)]
pub struct DefaultKeyValueConverterFactory {
    ring: KeyRing,
    plaintext: Arc<PlaintextKeyValueConverter>,
    aes: Arc<AesCryptoKeyValueConverter>,
}

impl DefaultKeyValueConverterFactory {
    pub fn new(ring: KeyRing) -> Self {
        Self {
            plaintext: Arc::new(PlaintextKeyValueConverter::new(KeyAccess::ReadWrite)),
            aes: Arc::new(AesCryptoKeyValueConverter::new(KeyAccess::ReadWrite, ring.clone())),
            ring,
        }
    }

    /// Factory that never encrypts.
    pub fn plaintext() -> Self {
        Self::new(KeyRing::empty())
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.ring
    }
}

impl KeyValueConverterFactory for DefaultKeyValueConverterFactory {
    fn get_value_converter(
        &self,
        key: &Key,
        action: KeyConversionAction,
    ) -> Result<Arc<dyn KeyValueConverter>> {
        match action {
            KeyConversionAction::Write if self.ring.is_enabled() => Ok(self.aes.clone()),
            KeyConversionAction::Write => Ok(self.plaintext.clone()),
            KeyConversionAction::Read if !key.is_encrypted => Ok(self.plaintext.clone()),
            KeyConversionAction::Read if self.ring.is_enabled() => Ok(self.aes.clone()),
            KeyConversionAction::Read => Err(SecretsError::Configuration(
                MISSING_KEY_CONFIGURATION.into(),
            )),
        }
    }

    fn is_stale(&self, key: &Key) -> bool {
        match (self.ring.active_id(), key.is_encrypted) {
            (Some(active), true) => key.encryption_key_id.as_deref() != Some(active.to_string().as_str()),
            (Some(_), false) => true,
            (None, true) => true,
            (None, false) => false,
        }
    }
}
