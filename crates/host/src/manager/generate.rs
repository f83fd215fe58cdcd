//! Random secret generation.

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Random bytes drawn per generated secret.
pub const SECRET_BYTE_LEN: usize = 40;

/// Draw [`SECRET_BYTE_LEN`] bytes from the OS CSPRNG and encode them.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTE_LEN];
    OsRng.fill_bytes(&mut bytes);
    encode_secret(&bytes)
}

/// Standard base64 with every `+` replaced by `a`.
///
/// Persisted keys from other hosts use this exact alphabet, so the mapping
/// must not change.
pub fn encode_secret(bytes: &[u8]) -> String {
    STANDARD.encode(bytes).replace('+', "a")
}
