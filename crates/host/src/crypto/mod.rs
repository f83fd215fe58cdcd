//! Secret value encryption primitives and the encryption key ring.
//!
//! This module is free of storage and HTTP dependencies. It provides the
//! low-level protect/unprotect operations used by the AES key value converter.
//!
//! # Payload format
//!
//! ```text
//! base64url-no-pad( magic[4] | key_id[16] | nonce[12] | ciphertext+tag )
//! ```
//!
//! The key id lets a reader decide whether a value was written with the
//! currently active key without decrypting it.

pub mod cipher;
pub mod keyring;

pub use cipher::KEY_LEN;
pub use keyring::{KeyRing, RingKey};
