//! Secret document types: [`Key`], [`HostSecrets`], [`FunctionSecrets`].
//!
//! These are the persisted shapes. Whether a [`Key`]'s value is plaintext or
//! ciphertext is recorded on the key itself; converting between the two is the
//! host crate's job.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name given to the master key of a freshly generated host document.
pub const DEFAULT_MASTER_KEY_NAME: &str = "master";

/// Name given to the first key generated for a new scope.
pub const DEFAULT_FUNCTION_KEY_NAME: &str = "default";

/// File name of the host-scope document inside the secrets directory.
pub const HOST_SECRETS_FILE_NAME: &str = "host.json";

/// Addressing dimension of a secrets document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptSecretsType {
    /// The single host-wide document.
    Host,
    /// One document per function name.
    Function,
}

impl fmt::Display for ScriptSecretsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptSecretsType::Host => f.write_str("host"),
            ScriptSecretsType::Function => f.write_str("function"),
        }
    }
}

/// A named secret and its encryption metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub is_encrypted: bool,
    /// Identifier of the encryption key that produced `value`, when encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    /// Set when the persisted form of this key no longer matches the active
    /// encryption settings. Never persisted.
    #[serde(skip)]
    pub is_stale: bool,
}

impl Key {
    /// A plaintext key with no encryption metadata.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_encrypted: false,
            encryption_key_id: None,
            is_stale: false,
        }
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret values, encrypted or not.
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("is_encrypted", &self.is_encrypted)
            .field("encryption_key_id", &self.encryption_key_id)
            .field("is_stale", &self.is_stale)
            .finish()
    }
}

/// The host-scope document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSecrets {
    pub master_key: Key,
    /// Host-wide function keys, usable for any function in a merged lookup.
    #[serde(default)]
    pub function_keys: Vec<Key>,
}

impl HostSecrets {
    pub fn has_stale_keys(&self) -> bool {
        self.master_key.is_stale || self.function_keys.iter().any(|k| k.is_stale)
    }
}

/// A function-scope document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSecrets {
    #[serde(default)]
    pub keys: Vec<Key>,
}

impl FunctionSecrets {
    pub fn new(keys: Vec<Key>) -> Self {
        Self { keys }
    }

    pub fn has_stale_keys(&self) -> bool {
        self.keys.iter().any(|k| k.is_stale)
    }
}

/// Either kind of secrets document, for code paths that work on both scopes.
///
/// The "function keys" of a document are the keys that mutation operations
/// act on: the host's `function_keys` or the function's `keys`. The host
/// master key is only ever replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSecrets {
    Host(HostSecrets),
    Function(FunctionSecrets),
}

impl ScriptSecrets {
    pub fn secrets_type(&self) -> ScriptSecretsType {
        match self {
            ScriptSecrets::Host(_) => ScriptSecretsType::Host,
            ScriptSecrets::Function(_) => ScriptSecretsType::Function,
        }
    }

    fn function_keys(&self) -> &Vec<Key> {
        match self {
            ScriptSecrets::Host(h) => &h.function_keys,
            ScriptSecrets::Function(f) => &f.keys,
        }
    }

    fn function_keys_mut(&mut self) -> &mut Vec<Key> {
        match self {
            ScriptSecrets::Host(h) => &mut h.function_keys,
            ScriptSecrets::Function(f) => &mut f.keys,
        }
    }

    /// Every key in the document, master key first for host documents.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        let master = match self {
            ScriptSecrets::Host(h) => Some(&h.master_key),
            ScriptSecrets::Function(_) => None,
        };
        master.into_iter().chain(self.function_keys().iter())
    }

    /// Mutable access to every key in the document.
    pub fn keys_mut(&mut self) -> impl Iterator<Item = &mut Key> {
        let (master, rest) = match self {
            ScriptSecrets::Host(h) => (Some(&mut h.master_key), &mut h.function_keys),
            ScriptSecrets::Function(f) => (None, &mut f.keys),
        };
        master.into_iter().chain(rest.iter_mut())
    }

    /// Look up a function key by name, ignoring case.
    pub fn get_function_key(&self, name: &str) -> Option<&Key> {
        self.function_keys().iter().find(|k| k.is_named(name))
    }

    pub fn add_key(&mut self, key: Key) {
        self.function_keys_mut().push(key);
    }

    /// Remove the function key called `name`. Returns whether one was removed.
    pub fn remove_key(&mut self, name: &str) -> bool {
        let keys = self.function_keys_mut();
        let before = keys.len();
        keys.retain(|k| !k.is_named(name));
        keys.len() != before
    }

    pub fn has_stale_keys(&self) -> bool {
        self.keys().any(|k| k.is_stale)
    }
}

impl From<HostSecrets> for ScriptSecrets {
    fn from(h: HostSecrets) -> Self {
        ScriptSecrets::Host(h)
    }
}

impl From<FunctionSecrets> for ScriptSecrets {
    fn from(f: FunctionSecrets) -> Self {
        ScriptSecrets::Function(f)
    }
}
