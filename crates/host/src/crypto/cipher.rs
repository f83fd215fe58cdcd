//! AES-256-GCM-SIV protection of individual secret values.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so an accidental nonce collision between two protected secrets does not
//! break confidentiality the way it would with plain AES-GCM.
//!
//! Every protected payload carries the id of the key-ring entry that produced
//! it in a fixed-size clear header, authenticated as associated data. That
//! lets callers tell which key a value was written with (and so whether it is
//! stale) without decrypting it.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use uuid::Uuid;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Byte length of the key id embedded in the header.
pub const KEY_ID_LEN: usize = 16;

/// Magic bytes at the start of every protected payload.
pub const MAGIC_HEADER: [u8; 4] = [0x09, 0xF0, 0xC9, 0xF0];

/// Length of the clear header: magic + key id.
pub const HEADER_LEN: usize = MAGIC_HEADER.len() + KEY_ID_LEN;

/// A parsed protected value.
///
/// The string representation is
/// `base64url(magic | key_id | nonce | ciphertext+tag)` without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPayload {
    /// Key-ring entry that produced the ciphertext.
    pub key_id: Uuid,
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl ProtectedPayload {
    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        let mut raw = Vec::with_capacity(HEADER_LEN + NONCE_LEN + self.ciphertext.len());
        raw.extend_from_slice(&header(self.key_id));
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Parse a protected value string.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the string is not base64url,
    /// is too short, or does not start with [`MAGIC_HEADER`].
    pub fn from_str(s: &str) -> Result<Self, CipherError> {
        let raw = decode(s)?;
        let key_id = key_id_from_raw(&raw)?;
        if raw.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            return Err(CipherError::InvalidFormat("payload truncated"));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
        Ok(Self {
            key_id,
            nonce,
            ciphertext: raw[HEADER_LEN + NONCE_LEN..].to_vec(),
        })
    }
}

/// Read only the key id out of a protected value string.
///
/// # Errors
///
/// Returns [`CipherError::InvalidFormat`] if the payload is shorter than the
/// header or carries the wrong magic bytes.
pub fn key_id_from_payload(s: &str) -> Result<Uuid, CipherError> {
    key_id_from_raw(&decode(s)?)
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The payload does not match the expected layout.
    #[error("invalid cryptographic payload: {0}")]
    InvalidFormat(&'static str),
}

/// Encrypt `plaintext` under `key`, tagging the result with `key_id`.
///
/// A random 96-bit nonce is generated per call via the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn encrypt(plaintext: &[u8], key: &[u8], key_id: Uuid) -> Result<ProtectedPayload, CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let aad = header(key_id);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(ProtectedPayload {
        key_id,
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a [`ProtectedPayload`] back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key,
/// tampered ciphertext or header).
pub fn decrypt(payload: &ProtectedPayload, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let aad = header(payload.key_id);
    cipher
        .decrypt(
            Nonce::from_slice(&payload.nonce),
            Payload {
                msg: payload.ciphertext.as_ref(),
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::AeadFailure)
}

fn header(key_id: Uuid) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..MAGIC_HEADER.len()].copy_from_slice(&MAGIC_HEADER);
    out[MAGIC_HEADER.len()..].copy_from_slice(key_id.as_bytes());
    out
}

fn decode(s: &str) -> Result<Vec<u8>, CipherError> {
    URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|_| CipherError::InvalidFormat("not base64url"))
}

fn key_id_from_raw(raw: &[u8]) -> Result<Uuid, CipherError> {
    if raw.len() < HEADER_LEN {
        return Err(CipherError::InvalidFormat("unable to extract key id"));
    }
    if raw[..MAGIC_HEADER.len()] != MAGIC_HEADER {
        return Err(CipherError::InvalidFormat("bad magic header"));
    }
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&raw[MAGIC_HEADER.len()..HEADER_LEN]);
    Ok(Uuid::from_bytes(id))
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
