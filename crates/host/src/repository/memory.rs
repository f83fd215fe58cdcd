//! [`MemorySecretsRepository`]: an in-process repository.
//!
//! Writes made through the [`SecretsRepository`] trait are treated as this
//! process's own and publish nothing. [`MemorySecretsRepository::external_write`]
//! and [`MemorySecretsRepository::external_delete`] model another instance
//! changing a document and publish a [`SecretsChanged`] event, the way a
//! message-bus transport would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use common::{error::Result, ScriptSecretsType, SecretsError};
use tokio::sync::broadcast;

use super::{SecretsChanged, SecretsRepository, CHANGE_CHANNEL_CAPACITY};

type DocumentKey = (ScriptSecretsType, String);

pub struct MemorySecretsRepository {
    documents: Mutex<HashMap<DocumentKey, String>>,
    changes: broadcast::Sender<SecretsChanged>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemorySecretsRepository {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            documents: Mutex::new(HashMap::new()),
            changes,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `read` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw document text, bypassing the counters.
    pub fn document(&self, secrets_type: ScriptSecretsType, name: &str) -> Option<String> {
        self.lock().get(&document_key(secrets_type, name)).cloned()
    }

    /// Replace a document as another process would, and announce it.
    pub fn external_write(&self, secrets_type: ScriptSecretsType, name: &str, content: &str) {
        let key = document_key(secrets_type, name);
        let change = SecretsChanged {
            secrets_type,
            name: key.1.clone(),
        };
        self.lock().insert(key, content.to_owned());
        let _ = self.changes.send(change);
    }

    /// Remove a document as another process would, and announce it.
    pub fn external_delete(&self, secrets_type: ScriptSecretsType, name: &str) {
        let key = document_key(secrets_type, name);
        let change = SecretsChanged {
            secrets_type,
            name: key.1.clone(),
        };
        self.lock().remove(&key);
        let _ = self.changes.send(change);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentKey, String>> {
        // A panic while holding the lock cannot leave a map half-updated.
        self.documents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MemorySecretsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretsRepository")
            .field("documents", &self.lock().len())
            .field("reads", &self.read_count())
            .field("writes", &self.write_count())
            .finish()
    }
}

impl Default for MemorySecretsRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn document_key(secrets_type: ScriptSecretsType, name: &str) -> DocumentKey {
    match secrets_type {
        ScriptSecretsType::Host => (secrets_type, String::new()),
        ScriptSecretsType::Function => (secrets_type, name.to_lowercase()),
    }
}

fn validate(secrets_type: ScriptSecretsType, name: &str) -> Result<()> {
    if secrets_type == ScriptSecretsType::Function && name.trim().is_empty() {
        return Err(SecretsError::InvalidArgument(
            "function name must not be empty".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl SecretsRepository for MemorySecretsRepository {
    async fn read(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<Option<String>> {
        validate(secrets_type, name)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lock()
            .get(&document_key(secrets_type, name))
            .filter(|t| !t.trim().is_empty())
            .cloned())
    }

    async fn write(&self, secrets_type: ScriptSecretsType, name: &str, content: &str) -> Result<()> {
        validate(secrets_type, name)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .insert(document_key(secrets_type, name), content.to_owned());
        Ok(())
    }

    async fn delete(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<bool> {
        validate(secrets_type, name)?;
        Ok(self
            .lock()
            .remove(&document_key(secrets_type, name))
            .is_some())
    }

    async fn list_function_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .lock()
            .keys()
            .filter(|(t, _)| *t == ScriptSecretsType::Function)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretsChanged> {
        self.changes.subscribe()
    }
}
