//! [`FileSystemSecretsRepository`]: one JSON file per document in a secrets
//! directory.
//!
//! ```text
//! <secrets_path>/
//! ├── host.json
//! ├── httptrigger.json
//! └── queuetrigger.json
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! target, so a reader only ever sees a complete document.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use common::secrets::HOST_SECRETS_FILE_NAME;
use common::{error::Result, ScriptSecretsType, SecretsError};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{watch, SecretsChanged, SecretsRepository, CHANGE_CHANNEL_CAPACITY};

#[derive(Debug)]
pub struct FileSystemSecretsRepository {
    secrets_path: PathBuf,
    changes: broadcast::Sender<SecretsChanged>,
    shutdown: CancellationToken,
}

impl FileSystemSecretsRepository {
    /// Open (creating if needed) the secrets directory at `secrets_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Io`] if the directory cannot be created.
    pub async fn open(secrets_path: impl Into<PathBuf>) -> Result<Self> {
        let secrets_path = secrets_path.into();
        tokio::fs::create_dir_all(&secrets_path).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        info!(path = %secrets_path.display(), "secrets repository opened");
        Ok(Self {
            secrets_path,
            changes,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn secrets_path(&self) -> &Path {
        &self.secrets_path
    }

    /// Start watching the directory for out-of-band changes.
    ///
    /// The initial snapshot is taken before this returns. The watcher stops
    /// when the repository is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Io`] if the initial scan fails.
    pub async fn watch(&self, interval: Duration) -> Result<tokio::task::JoinHandle<()>> {
        let baseline = watch::scan(&self.secrets_path).await?;
        Ok(watch::spawn(
            self.secrets_path.clone(),
            baseline,
            self.changes.clone(),
            interval,
            self.shutdown.child_token(),
        ))
    }

    /// An existing differently-cased file for `path`, if any.
    async fn case_variant(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(None);
        };
        Ok(case_variants(&self.secrets_path, &file_name).await?.into_iter().next())
    }

    fn document_path(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<PathBuf> {
        match secrets_type {
            ScriptSecretsType::Host => Ok(self.secrets_path.join(HOST_SECRETS_FILE_NAME)),
            ScriptSecretsType::Function => {
                let file_name = function_file_name(name)?;
                Ok(self.secrets_path.join(file_name))
            }
        }
    }
}

impl Drop for FileSystemSecretsRepository {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// File name for a function document, rejecting names that would escape the
/// directory or collide with the host document.
fn function_file_name(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(SecretsError::InvalidArgument(
            "function name must not be empty".into(),
        ));
    }
    if name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(SecretsError::InvalidArgument(format!(
            "invalid function name: {name}"
        )));
    }
    let file_name = format!("{name}.json");
    if file_name.eq_ignore_ascii_case(HOST_SECRETS_FILE_NAME) {
        return Err(SecretsError::InvalidArgument(format!(
            "function name {name} is reserved"
        )));
    }
    Ok(file_name)
}

/// Write `data` to `path` via a temp file + rename.
async fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("path has no parent: {}", path.display())))?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("secrets");
    let temp = parent.join(format!(".{file_name}.tmp.{}", Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
        return result;
    }
    fsync_dir(parent).await
}

/// Make a completed rename durable.
#[cfg(unix)]
async fn fsync_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Every file in `dir` whose name equals `file_name` ignoring case.
///
/// Function names are case-insensitive but documents dropped in by another
/// process may not be lowercased.
async fn case_variants(dir: &Path, file_name: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case(file_name) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl SecretsRepository for FileSystemSecretsRepository {
    async fn read(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<Option<String>> {
        let path = self.document_path(secrets_type, name)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(variant) = self.case_variant(&path).await? else {
                    return Ok(None);
                };
                match tokio::fs::read_to_string(&variant).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    async fn write(&self, secrets_type: ScriptSecretsType, name: &str, content: &str) -> Result<()> {
        let path = self.document_path(secrets_type, name)?;
        let data = content.as_bytes().to_vec();

        // Detached so that a caller dropping this future cannot interrupt a
        // replace that has already started.
        let task = tokio::spawn(async move { atomic_write(&path, &data).await });
        task.await.map_err(io::Error::other)??;

        debug!(secrets_type = %secrets_type, name, "secrets document written");
        Ok(())
    }

    async fn delete(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<bool> {
        let path = self.document_path(secrets_type, name)?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        let mut deleted = false;
        for variant in case_variants(&self.secrets_path, &file_name).await? {
            match tokio::fs::remove_file(&variant).await {
                Ok(()) => {
                    debug!(secrets_type = %secrets_type, path = %variant.display(), "secrets document deleted");
                    deleted = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn list_function_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.secrets_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(change) = watch::change_for_file(&file_name) {
                if change.secrets_type == ScriptSecretsType::Function {
                    names.push(change.name);
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretsChanged> {
        self.changes.subscribe()
    }
}
