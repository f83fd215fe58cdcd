//! Key value converters: translate a [`Key`] between its persisted and its
//! usable (plaintext) form.
//!
//! A converter is built with a fixed [`KeyAccess`] mode and refuses operations
//! outside it. The [`KeyValueConverterFactory`] decides which converter applies
//! to a given key, which keeps the secret manager unaware of whether (and how)
//! values are encrypted at rest.

pub mod aes;
pub mod factory;
pub mod plaintext;

pub use aes::AesCryptoKeyValueConverter;
pub use factory::{DefaultKeyValueConverterFactory, KeyValueConverterFactory};
pub use plaintext::PlaintextKeyValueConverter;

use common::{error::Result, Key, SecretsError};

/// Operations a converter instance is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAccess {
    Read,
    Write,
    ReadWrite,
}

impl KeyAccess {
    pub fn can_read(self) -> bool {
        matches!(self, KeyAccess::Read | KeyAccess::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, KeyAccess::Write | KeyAccess::ReadWrite)
    }

    /// Fail with [`SecretsError::AccessViolation`] unless `required` is allowed.
    pub fn validate(self, required: KeyConversionAction) -> Result<()> {
        let allowed = match required {
            KeyConversionAction::Read => self.can_read(),
            KeyConversionAction::Write => self.can_write(),
        };
        if allowed {
            Ok(())
        } else {
            Err(SecretsError::AccessViolation(format!(
                "converter with {self:?} access cannot {required:?}"
            )))
        }
    }
}

/// What the caller intends to do with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyConversionAction {
    Read,
    Write,
}

/// Reads and writes key values under an access-mode contract.
pub trait KeyValueConverter: Send + Sync + std::fmt::Debug {
    /// The access mode this converter was constructed with.
    fn access(&self) -> KeyAccess;

    /// Return the plaintext value of `key`.
    fn read_value(&self, key: &Key) -> Result<String>;

    /// Return the persisted form of `key`.
    fn write_value(&self, key: &Key) -> Result<Key>;
}
