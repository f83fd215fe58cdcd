//! [`KeyRing`]: the active secret-encryption key plus the keys it replaced.

use std::sync::Arc;

use arc_swap::ArcSwap;
use common::SecretsError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::cipher::KEY_LEN;

/// Minimum accepted length of configured key material.
pub const MIN_MATERIAL_LEN: usize = 16;

/// Purpose string mixed into every derived AES key.
pub const PROTECTION_PURPOSE: &[u8] = b"function-secrets";

/// Errors produced while building or rotating the key ring.
#[derive(Debug, Error)]
pub enum KeyRingError {
    /// The configured material is not valid hex.
    #[error("encryption key is not valid hex")]
    InvalidHex,

    /// The configured material is too short to derive a key from.
    #[error("encryption key material too short: expected at least {MIN_MATERIAL_LEN} bytes, got {0}")]
    TooShort(usize),
}

impl From<KeyRingError> for SecretsError {
    fn from(e: KeyRingError) -> Self {
        SecretsError::Configuration(e.to_string())
    }
}

/// Fixed-size derived AES key.
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which key material lives in RAM.
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// One key in the ring: its id and the derived AES key.
#[derive(Debug)]
pub struct RingKey {
    pub id: Uuid,
    pub key: KeyBytes,
}

impl RingKey {
    /// Derive a ring key from raw material.
    ///
    /// The id is the first 16 bytes of SHA-256 over the material, so the same
    /// material always yields the same id on every host instance.
    pub fn from_material(material: &[u8]) -> Result<Self, KeyRingError> {
        if material.len() < MIN_MATERIAL_LEN {
            return Err(KeyRingError::TooShort(material.len()));
        }

        let digest = Sha256::digest(material);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);

        // HMAC accepts keys of any length; this cannot fail.
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(material)
            .map_err(|_| KeyRingError::TooShort(material.len()))?;
        mac.update(PROTECTION_PURPOSE);
        let derived = mac.finalize().into_bytes();

        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(&derived[..KEY_LEN]);

        Ok(Self {
            id: Uuid::from_bytes(id),
            key: KeyBytes(buf),
        })
    }

    /// Parse hex-encoded material.
    pub fn from_hex(material: &str) -> Result<Self, KeyRingError> {
        let bytes = hex::decode(material.trim()).map_err(|_| KeyRingError::InvalidHex)?;
        Self::from_material(&bytes)
    }
}

#[derive(Debug, Default)]
struct RingState {
    active: Option<Arc<RingKey>>,
    previous: Vec<Arc<RingKey>>,
}

/// Shared set of encryption keys.
///
/// An empty ring means encryption is disabled and secrets are stored in
/// plaintext. Reads are lock-free ([`ArcSwap`]); [`KeyRing::rotate`] swaps in a
/// new state atomically.
#[derive(Clone, Debug)]
pub struct KeyRing {
    inner: Arc<ArcSwap<RingState>>,
}

impl KeyRing {
    /// A ring with no keys: encryption disabled.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(RingState::default())),
        }
    }

    /// Build a ring from hex material: an optional active key and any number
    /// of previous keys still accepted for decryption.
    ///
    /// # Errors
    ///
    /// Returns [`KeyRingError`] if any material is malformed.
    pub fn from_hex(active: Option<&str>, previous: &[String]) -> Result<Self, KeyRingError> {
        let active = active.map(RingKey::from_hex).transpose()?.map(Arc::new);
        let previous = previous
            .iter()
            .map(|m| RingKey::from_hex(m).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(RingState { active, previous })),
        })
    }

    /// Whether an active key is configured.
    pub fn is_enabled(&self) -> bool {
        self.inner.load().active.is_some()
    }

    /// The key new values are encrypted with.
    pub fn active(&self) -> Option<Arc<RingKey>> {
        self.inner.load().active.clone()
    }

    /// Id of the active key, if any.
    pub fn active_id(&self) -> Option<Uuid> {
        self.inner.load().active.as_ref().map(|k| k.id)
    }

    /// Find a key (active or previous) by id.
    pub fn find(&self, id: Uuid) -> Option<Arc<RingKey>> {
        let state = self.inner.load();
        state
            .active
            .iter()
            .chain(state.previous.iter())
            .find(|k| k.id == id)
            .cloned()
    }

    /// Make `material` the active key, keeping the current one for decryption.
    ///
    /// Returns the id of the new active key.
    pub fn rotate(&self, material: &[u8]) -> Result<Uuid, KeyRingError> {
        let new_key = Arc::new(RingKey::from_material(material)?);
        let id = new_key.id;
        self.inner.rcu(|state| {
            let mut previous: Vec<Arc<RingKey>> = state.active.iter().cloned().collect();
            previous.extend(state.previous.iter().cloned());
            previous.retain(|k| k.id != id);
            RingState {
                active: Some(new_key.clone()),
                previous,
            }
        });
        Ok(id)
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::empty()
    }
}
