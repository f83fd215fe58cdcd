//! JSON (de)serialisation of secrets documents, dispatched on
//! [`ScriptSecretsType`].
//!
//! ```text
//! host.json      { "masterKey": Key, "functionKeys": [Key] }
//! <function>.json { "keys": [Key] }
//! Key            { "name", "value", "isEncrypted", "encryptionKeyId"? }
//! ```

use common::{
    error::Result, FunctionSecrets, HostSecrets, ScriptSecrets, ScriptSecretsType, SecretsError,
};

/// Parse `text` as a document of the given type.
///
/// # Errors
///
/// Returns [`SecretsError::Format`] if the text is not valid JSON for the
/// declared type or contains a key without a name.
pub fn deserialize_secrets(secrets_type: ScriptSecretsType, text: &str) -> Result<ScriptSecrets> {
    let secrets: ScriptSecrets = match secrets_type {
        ScriptSecretsType::Host => serde_json::from_str::<HostSecrets>(text)?.into(),
        ScriptSecretsType::Function => serde_json::from_str::<FunctionSecrets>(text)?.into(),
    };

    if let Some(key) = secrets.keys().find(|k| k.name.trim().is_empty()) {
        return Err(SecretsError::Format(format!(
            "{secrets_type} secrets contain a key without a name (encrypted: {})",
            key.is_encrypted
        )));
    }
    Ok(secrets)
}

/// Render a document as pretty-printed JSON.
pub fn serialize_secrets(secrets: &ScriptSecrets) -> Result<String> {
    let text = match secrets {
        ScriptSecrets::Host(h) => serde_json::to_string_pretty(h)?,
        ScriptSecrets::Function(f) => serde_json::to_string_pretty(f)?,
    };
    Ok(text)
}
