//! Common secret types, protocol definitions, and errors shared across the
//! function host crates.

pub mod error;
pub mod protocol;
pub mod secrets;

pub use error::SecretsError;
pub use secrets::{FunctionSecrets, HostSecrets, Key, ScriptSecrets, ScriptSecretsType};
