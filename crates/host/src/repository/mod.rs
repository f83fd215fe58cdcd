//! Durable storage of serialised secrets documents and change notification.
//!
//! Documents are addressed by `(ScriptSecretsType, name)`; the name is empty
//! for the host document and the lowercased function name otherwise.
//!
//! # Change notification
//!
//! Every repository owns a [`broadcast`] channel of [`SecretsChanged`] events.
//! Subscribers (the secret manager) treat each event as "whatever is cached
//! for that scope/name is no longer trustworthy". How events are produced is
//! up to the implementation: the file system repository polls its directory,
//! the in-memory repository publishes on externally injected writes.

pub mod file;
pub mod memory;
pub mod watch;

pub use file::FileSystemSecretsRepository;
pub use memory::MemorySecretsRepository;

use async_trait::async_trait;
use common::{error::Result, ScriptSecretsType};
use tokio::sync::broadcast;

/// Capacity of each repository's change channel. A subscriber that falls
/// further behind than this receives a `Lagged` error and must assume
/// everything changed.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A secrets document was created, modified, deleted, or renamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretsChanged {
    pub secrets_type: ScriptSecretsType,
    /// Lowercased function name; empty for the host document.
    pub name: String,
}

impl SecretsChanged {
    pub fn host() -> Self {
        Self {
            secrets_type: ScriptSecretsType::Host,
            name: String::new(),
        }
    }

    pub fn function(name: &str) -> Self {
        Self {
            secrets_type: ScriptSecretsType::Function,
            name: name.to_lowercase(),
        }
    }
}

/// Storage for secrets documents.
///
/// Implementations must make `write` all-or-nothing: a concurrent reader sees
/// either the previous document or the new one, never a partial one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretsRepository: Send + Sync {
    /// Read a document. `Ok(None)` means it has not been generated yet.
    async fn read(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<Option<String>>;

    /// Atomically create or replace a document.
    async fn write(&self, secrets_type: ScriptSecretsType, name: &str, content: &str) -> Result<()>;

    /// Remove a document. Returns whether anything was deleted.
    async fn delete(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<bool>;

    /// Names of every persisted function document.
    async fn list_function_names(&self) -> Result<Vec<String>>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SecretsChanged>;
}
