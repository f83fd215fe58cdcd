//! [`SecretManager`]: resolves, generates, mutates and invalidates secrets.
//!
//! Lifecycle of a lookup:
//! 1. Serve from [`SecretsCache`] when present.
//! 2. Otherwise read the persisted document; if there is none, generate one
//!    and persist it.
//! 3. Resolve every key to plaintext through the converter factory. When any
//!    key is stale, re-encrypt the whole document and persist it again.
//! 4. Publish the plaintext result to the cache.
//!
//! Cached entries are dropped on every repository change notification for
//! their scope and on every mutation made through this manager.
//!
//! Loads that miss the cache and all mutations run one at a time behind a
//! single gate. A mutation keeps the gate until its write has landed and the
//! cache entry is dropped, even if the caller stops waiting.

pub mod cache;
pub mod generate;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::protocol::{HostSecretsInfo, KeyOperationResult, OperationResult};
use common::secrets::{DEFAULT_FUNCTION_KEY_NAME, DEFAULT_MASTER_KEY_NAME};
use common::{
    error::Result, FunctionSecrets, HostSecrets, Key, ScriptSecrets, ScriptSecretsType,
    SecretsError,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::convert::KeyValueConverterFactory;
use crate::repository::{SecretsChanged, SecretsRepository};
use crate::serializer::{deserialize_secrets, serialize_secrets};

pub use cache::{ResolvedKeys, SecretsCache};
pub use generate::generate_secret;

pub struct SecretManager {
    repository: Arc<dyn SecretsRepository>,
    converters: Arc<dyn KeyValueConverterFactory>,
    cache: Arc<SecretsCache>,
    gate: Arc<Mutex<()>>,
    listener: JoinHandle<()>,
}

impl SecretManager {
    /// Build a manager and start listening for repository change events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        repository: Arc<dyn SecretsRepository>,
        converters: Arc<dyn KeyValueConverterFactory>,
    ) -> Self {
        let cache = Arc::new(SecretsCache::new());
        let listener = spawn_listener(repository.subscribe(), cache.clone());
        Self {
            repository,
            converters,
            cache,
            gate: Arc::new(Mutex::new(())),
            listener,
        }
    }

    /// Like [`SecretManager::new`], optionally resolving (and so generating)
    /// the host secrets before returning.
    ///
    /// # Errors
    ///
    /// Propagates any failure to load or create the host document.
    pub async fn with_host_secrets(
        repository: Arc<dyn SecretsRepository>,
        converters: Arc<dyn KeyValueConverterFactory>,
        create_if_missing: bool,
    ) -> Result<Self> {
        let manager = Self::new(repository, converters);
        if create_if_missing {
            manager.get_host_secrets().await?;
        }
        Ok(manager)
    }

    /// Drop whatever is cached for the scope named by `change`.
    pub fn on_secrets_changed(&self, change: &SecretsChanged) {
        apply_change(&self.cache, change);
    }

    pub fn has_cached_host_secrets(&self) -> bool {
        self.cache.has_host()
    }

    pub fn cached_function_count(&self) -> usize {
        self.cache.function_count()
    }

    /// Plaintext host secrets, generating them on first use.
    ///
    /// # Errors
    ///
    /// Repository, format, and converter errors propagate.
    pub async fn get_host_secrets(&self) -> Result<Arc<HostSecretsInfo>> {
        if let Some(host) = self.cache.host() {
            return Ok(host);
        }
        let _gate = self.gate.lock().await;
        if let Some(host) = self.cache.host() {
            return Ok(host);
        }

        let generation = self.cache.generation();
        let info = match self.resolve(ScriptSecretsType::Host, "").await? {
            ScriptSecrets::Host(host) => HostSecretsInfo {
                master_key: host.master_key.value,
                function_keys: host
                    .function_keys
                    .into_iter()
                    .map(|k| (k.name, k.value))
                    .collect(),
            },
            ScriptSecrets::Function(_) => {
                return Err(SecretsError::Format(
                    "host document resolved to function secrets".into(),
                ))
            }
        };
        Ok(self.cache.publish_host(generation, info))
    }

    /// Plaintext keys of `function_name`, generating a default key on first
    /// use. With `merged`, host function keys are added for every name the
    /// function does not define itself.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidArgument`] for an empty name; repository,
    /// format, and converter errors propagate.
    pub async fn get_function_secrets(
        &self,
        function_name: &str,
        merged: bool,
    ) -> Result<ResolvedKeys> {
        let name = normalize_function_name(function_name)?;
        let keys = self.function_keys(&name).await?;

        if !merged {
            return Ok(keys);
        }

        let host = self.get_host_secrets().await?;
        let mut combined = HashMap::clone(&keys);
        for (key_name, value) in &host.function_keys {
            if !combined.keys().any(|k| k.eq_ignore_ascii_case(key_name)) {
                combined.insert(key_name.clone(), value.clone());
            }
        }
        Ok(Arc::new(combined))
    }

    /// Add `secret_name` to the function's keys (or the host's function keys
    /// when `function_name` is `None`), replacing any key of the same name.
    /// A value is generated when none is given.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidArgument`] for an empty secret or
    /// function name; repository, format, and converter errors propagate.
    pub async fn add_or_update_function_secret(
        &self,
        secret_name: &str,
        secret_value: Option<&str>,
        function_name: Option<&str>,
    ) -> Result<KeyOperationResult> {
        ensure_secret_name(secret_name)?;
        let (secrets_type, name) = scope(function_name)?;
        let gate = self.gate.clone().lock_owned().await;

        let mut secrets = match self.load(secrets_type, &name).await? {
            Some(secrets) => secrets,
            None => self.new_document(secrets_type)?,
        };

        let value = secret_value.map(str::to_owned).unwrap_or_else(generate_secret);
        let result = if secrets.remove_key(secret_name) {
            OperationResult::Updated
        } else {
            OperationResult::Created
        };
        secrets.add_key(self.create_key(secret_name, &value)?);

        self.commit(gate, &name, &secrets).await?;
        info!(
            secrets_type = %secrets_type,
            function = %name,
            secret = secret_name,
            result = ?result,
            "secret written"
        );
        Ok(KeyOperationResult::new(value, result))
    }

    /// Replace the host master key, generating a value when none is given.
    /// The result is `Created` when no host document existed.
    ///
    /// # Errors
    ///
    /// Repository, format, and converter errors propagate.
    pub async fn set_master_key(&self, value: Option<&str>) -> Result<KeyOperationResult> {
        let gate = self.gate.clone().lock_owned().await;
        let (mut host, result) = match self.load(ScriptSecretsType::Host, "").await? {
            Some(ScriptSecrets::Host(host)) => (host, OperationResult::Updated),
            Some(ScriptSecrets::Function(_)) => {
                return Err(SecretsError::Format(
                    "host document resolved to function secrets".into(),
                ))
            }
            None => (self.new_host_document()?, OperationResult::Created),
        };

        let value = value.map(str::to_owned).unwrap_or_else(generate_secret);
        host.master_key = self.create_key(&host.master_key.name, &value)?;

        self.commit(gate, "", &ScriptSecrets::Host(host)).await?;
        info!(result = ?result, "master key written");
        Ok(KeyOperationResult::new(value, result))
    }

    /// Remove `secret_name` from its scope. Returns `false`, without writing,
    /// when no such key exists.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidArgument`] for an empty secret or
    /// function name; repository and format errors propagate.
    pub async fn delete_secret(
        &self,
        secret_name: &str,
        function_name: Option<&str>,
    ) -> Result<bool> {
        ensure_secret_name(secret_name)?;
        let (secrets_type, name) = scope(function_name)?;
        let gate = self.gate.clone().lock_owned().await;

        let Some(mut secrets) = self.load(secrets_type, &name).await? else {
            return Ok(false);
        };
        if !secrets.remove_key(secret_name) {
            return Ok(false);
        }

        self.commit(gate, &name, &secrets).await?;
        info!(secrets_type = %secrets_type, function = %name, secret = secret_name, "secret deleted");
        Ok(true)
    }

    /// Delete function documents whose function no longer has a directory
    /// under `root_script_path`. The host document is never touched.
    ///
    /// Never fails: every error is logged and the pass moves on.
    pub async fn purge_old_files(&self, root_script_path: &Path) {
        let known = match function_directories(root_script_path).await {
            Ok(known) => known,
            Err(e) => {
                warn!(path = %root_script_path.display(), error = %e, "secrets purge skipped: script root unreadable");
                return;
            }
        };
        let persisted = match self.repository.list_function_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "secrets purge skipped: repository unreadable");
                return;
            }
        };

        for name in persisted {
            let name = name.to_lowercase();
            if known.contains(&name) {
                continue;
            }
            match self.repository.delete(ScriptSecretsType::Function, &name).await {
                Ok(deleted) => {
                    self.cache.invalidate_function(&name);
                    if deleted {
                        info!(function = %name, "purged secrets of removed function");
                    }
                }
                Err(e) => warn!(function = %name, error = %e, "failed to purge function secrets"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Cached or freshly resolved keys of an already normalised function name.
    async fn function_keys(&self, name: &str) -> Result<ResolvedKeys> {
        if let Some(keys) = self.cache.function(name) {
            return Ok(keys);
        }
        let _gate = self.gate.lock().await;
        if let Some(keys) = self.cache.function(name) {
            return Ok(keys);
        }

        let generation = self.cache.generation();
        let secrets = self.resolve(ScriptSecretsType::Function, name).await?;
        let keys = secrets
            .keys()
            .map(|k| (k.name.clone(), k.value.clone()))
            .collect();
        Ok(self.cache.publish_function(generation, name, keys))
    }

    /// Load or generate, then resolve to plaintext, repairing staleness.
    async fn resolve(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<ScriptSecrets> {
        let persisted = match self.load(secrets_type, name).await? {
            Some(secrets) => secrets,
            None => {
                let generated = match secrets_type {
                    ScriptSecretsType::Host => ScriptSecrets::Host(self.new_host_document()?),
                    ScriptSecretsType::Function => {
                        ScriptSecrets::Function(FunctionSecrets::new(vec![
                            self.create_key(DEFAULT_FUNCTION_KEY_NAME, &generate_secret())?,
                        ]))
                    }
                };
                self.persist(name, &generated).await?;
                info!(secrets_type = %secrets_type, function = %name, "secrets generated");
                generated
            }
        };

        let resolved = self.converters.read_secrets(&persisted)?;
        if resolved.has_stale_keys() {
            let refreshed = self.converters.refresh(&resolved)?;
            self.persist(name, &refreshed).await?;
            info!(secrets_type = %secrets_type, function = %name, "stale secrets re-encrypted");
        }
        Ok(resolved)
    }

    /// The persisted (possibly encrypted) document, if any.
    async fn load(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<Option<ScriptSecrets>> {
        match self.repository.read(secrets_type, name).await? {
            Some(text) => Ok(Some(deserialize_secrets(secrets_type, &text)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, name: &str, secrets: &ScriptSecrets) -> Result<()> {
        let text = serialize_secrets(secrets)?;
        self.repository.write(secrets.secrets_type(), name, &text).await?;
        debug!(secrets_type = %secrets.secrets_type(), function = %name, "secrets persisted");
        Ok(())
    }

    /// Persist a mutated document and drop its cache entry, releasing `gate`
    /// only afterwards. Runs detached so a dropped caller cannot stop it
    /// between the write and the invalidation.
    async fn commit(
        &self,
        gate: OwnedMutexGuard<()>,
        name: &str,
        secrets: &ScriptSecrets,
    ) -> Result<()> {
        let secrets_type = secrets.secrets_type();
        let text = serialize_secrets(secrets)?;
        let repository = self.repository.clone();
        let cache = self.cache.clone();
        let name = name.to_owned();

        let task = tokio::spawn(async move {
            let written = repository.write(secrets_type, &name, &text).await;
            invalidate(&cache, secrets_type, &name);
            drop(gate);
            written
        });
        let written = task.await.map_err(|e| SecretsError::Io(std::io::Error::other(e)))?;
        written?;
        debug!(secrets_type = %secrets_type, "secrets committed");
        Ok(())
    }

    /// Starting document for a mutation on a scope with nothing persisted.
    fn new_document(&self, secrets_type: ScriptSecretsType) -> Result<ScriptSecrets> {
        match secrets_type {
            ScriptSecretsType::Host => Ok(ScriptSecrets::Host(self.new_host_document()?)),
            ScriptSecretsType::Function => Ok(ScriptSecrets::Function(FunctionSecrets::default())),
        }
    }

    fn new_host_document(&self) -> Result<HostSecrets> {
        Ok(HostSecrets {
            master_key: self.create_key(DEFAULT_MASTER_KEY_NAME, &generate_secret())?,
            function_keys: vec![self.create_key(DEFAULT_FUNCTION_KEY_NAME, &generate_secret())?],
        })
    }

    /// Persisted form of a new key under the active converter.
    fn create_key(&self, name: &str, value: &str) -> Result<Key> {
        self.converters.write_key(&Key::new(name, value))
    }

}

impl Drop for SecretManager {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("converters", &self.converters)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Spawn a background task that purges secrets of removed functions.
///
/// The first pass runs immediately; later passes follow every `interval`.
pub fn purge_task(
    manager: Arc<SecretManager>,
    root_script_path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            manager.purge_old_files(&root_script_path).await;
        }
    })
}

fn spawn_listener(
    mut changes: broadcast::Receiver<SecretsChanged>,
    cache: Arc<SecretsCache>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => apply_change(&cache, &change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "secrets change notifications lagged; dropping cache");
                    cache.invalidate_all();
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn apply_change(cache: &SecretsCache, change: &SecretsChanged) {
    debug!(secrets_type = %change.secrets_type, name = %change.name, "invalidating cached secrets");
    match change.secrets_type {
        ScriptSecretsType::Host => cache.invalidate_host(),
        ScriptSecretsType::Function => cache.invalidate_function(&change.name.to_lowercase()),
    }
}

fn invalidate(cache: &SecretsCache, secrets_type: ScriptSecretsType, name: &str) {
    match secrets_type {
        ScriptSecretsType::Host => cache.invalidate_host(),
        ScriptSecretsType::Function => cache.invalidate_function(name),
    }
}

fn normalize_function_name(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(SecretsError::InvalidArgument(
            "function name must not be empty".into(),
        ));
    }
    Ok(name)
}

fn ensure_secret_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SecretsError::InvalidArgument(
            "secret name must not be empty".into(),
        ));
    }
    Ok(())
}

fn scope(function_name: Option<&str>) -> Result<(ScriptSecretsType, String)> {
    match function_name {
        Some(name) => Ok((ScriptSecretsType::Function, normalize_function_name(name)?)),
        None => Ok((ScriptSecretsType::Host, String::new())),
    }
}

/// Lowercased names of the directories directly under `root`, including
/// symlinks to directories. Dangling links are skipped.
async fn function_directories(root: &Path) -> std::io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        match tokio::fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_dir() => {
                names.insert(entry.file_name().to_string_lossy().to_lowercase());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DefaultKeyValueConverterFactory;
    use crate::crypto::KeyRing;
    use crate::repository::{
        FileSystemSecretsRepository, MemorySecretsRepository, MockSecretsRepository,
    };
    use async_trait::async_trait;

    const MATERIAL: &str = "0F75CA46E7EBDD39E4CA6B074D1F9A5972B849A55F91A248";
    const OTHER_MATERIAL: &str = "1F75CA46E7EBDD39E4CA6B074D1F9A5972B849A55F91A248";

    fn manager() -> (Arc<MemorySecretsRepository>, SecretManager) {
        let repo = Arc::new(MemorySecretsRepository::new());
        let manager = SecretManager::new(
            repo.clone(),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        (repo, manager)
    }

    fn encrypting_manager() -> (
        Arc<MemorySecretsRepository>,
        Arc<DefaultKeyValueConverterFactory>,
        SecretManager,
    ) {
        let repo = Arc::new(MemorySecretsRepository::new());
        let factory = Arc::new(DefaultKeyValueConverterFactory::new(
            KeyRing::from_hex(Some(MATERIAL), &[]).unwrap(),
        ));
        let manager = SecretManager::new(repo.clone(), factory.clone());
        (repo, factory, manager)
    }

    fn persisted(repo: &MemorySecretsRepository, secrets_type: ScriptSecretsType, name: &str) -> ScriptSecrets {
        let text = repo.document(secrets_type, name).expect("document persisted");
        deserialize_secrets(secrets_type, &text).unwrap()
    }

    fn io_error() -> SecretsError {
        SecretsError::Io(std::io::Error::other("disk unavailable"))
    }

    /// Memory repository whose writes land immediately but return late.
    #[derive(Default)]
    struct SlowWrites(MemorySecretsRepository);

    #[async_trait]
    impl SecretsRepository for SlowWrites {
        async fn read(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<Option<String>> {
            self.0.read(secrets_type, name).await
        }

        async fn write(&self, secrets_type: ScriptSecretsType, name: &str, content: &str) -> Result<()> {
            self.0.write(secrets_type, name, content).await?;
            time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }

        async fn delete(&self, secrets_type: ScriptSecretsType, name: &str) -> Result<bool> {
            self.0.delete(secrets_type, name).await
        }

        async fn list_function_names(&self) -> Result<Vec<String>> {
            self.0.list_function_names().await
        }

        fn subscribe(&self) -> broadcast::Receiver<SecretsChanged> {
            self.0.subscribe()
        }
    }

    fn mock_repository() -> MockSecretsRepository {
        let mut mock = MockSecretsRepository::new();
        mock.expect_subscribe()
            .returning(|| broadcast::channel(1).1);
        mock
    }

    #[tokio::test]
    async fn host_secrets_generated_and_persisted() {
        let (repo, manager) = manager();
        let host = manager.get_host_secrets().await.unwrap();

        assert_eq!(host.master_key.len(), 56);
        assert_eq!(host.function_keys.len(), 1);
        assert!(host.function_keys.contains_key(DEFAULT_FUNCTION_KEY_NAME));

        let ScriptSecrets::Host(doc) = persisted(&repo, ScriptSecretsType::Host, "") else {
            panic!("expected host document");
        };
        assert_eq!(doc.master_key.name, DEFAULT_MASTER_KEY_NAME);
        assert_eq!(doc.master_key.value, host.master_key);
        assert_eq!(repo.write_count(), 1);
    }

    #[tokio::test]
    async fn host_secrets_are_served_from_cache() {
        let (repo, manager) = manager();
        let first = manager.get_host_secrets().await.unwrap();
        let second = manager.get_host_secrets().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(repo.read_count(), 1);
    }

    #[tokio::test]
    async fn eager_host_secret_creation() {
        let repo = Arc::new(MemorySecretsRepository::new());
        let manager = SecretManager::with_host_secrets(
            repo.clone(),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
            true,
        )
        .await
        .unwrap();
        assert!(repo.document(ScriptSecretsType::Host, "").is_some());
        assert!(manager.has_cached_host_secrets());
    }

    #[tokio::test]
    async fn function_secrets_generated_with_default_key() {
        let (repo, manager) = manager();
        let keys = manager.get_function_secrets("HttpTrigger", false).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key(DEFAULT_FUNCTION_KEY_NAME));
        assert!(repo.document(ScriptSecretsType::Function, "httptrigger").is_some());
        // Non-merged lookups never touch the host document.
        assert!(repo.document(ScriptSecretsType::Host, "").is_none());
    }

    #[tokio::test]
    async fn function_names_are_case_insensitive() {
        let (repo, manager) = manager();
        let a = manager.get_function_secrets("HttpTrigger", false).await.unwrap();
        let b = manager.get_function_secrets("httptrigger", false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(repo.read_count(), 1);
    }

    #[tokio::test]
    async fn empty_function_name_is_rejected() {
        let (_repo, manager) = manager();
        assert!(matches!(
            manager.get_function_secrets("  ", false).await,
            Err(SecretsError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.add_or_update_function_secret("k", None, Some("")).await,
            Err(SecretsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn merged_lookup_prefers_function_keys() {
        let (repo, manager) = manager();
        repo.write(
            ScriptSecretsType::Host,
            "",
            r#"{"masterKey":{"name":"master","value":"M"},
                "functionKeys":[{"name":"default","value":"H"},{"name":"extra","value":"E"}]}"#,
        )
        .await
        .unwrap();
        repo.write(
            ScriptSecretsType::Function,
            "fn",
            r#"{"keys":[{"name":"default","value":"F"}]}"#,
        )
        .await
        .unwrap();

        let merged = manager.get_function_secrets("fn", true).await.unwrap();
        let expected = HashMap::from([
            ("default".to_string(), "F".to_string()),
            ("extra".to_string(), "E".to_string()),
        ]);
        assert_eq!(*merged, expected);

        // The unmerged view is unaffected.
        let own = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(own.len(), 1);
    }

    #[tokio::test]
    async fn add_then_update() {
        let (_repo, manager) = manager();
        let first = manager
            .add_or_update_function_secret("k", None, Some("fn"))
            .await
            .unwrap();
        assert_eq!(first.result, OperationResult::Created);

        let second = manager
            .add_or_update_function_secret("k", None, Some("fn"))
            .await
            .unwrap();
        assert_eq!(second.result, OperationResult::Updated);
        assert_ne!(first.secret, second.secret);

        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(keys["k"], second.secret);
        // A fresh function document starts empty rather than with a default key.
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_key_regardless_of_case() {
        let (repo, manager) = manager();
        manager
            .add_or_update_function_secret("Key", Some("one"), Some("fn"))
            .await
            .unwrap();
        let updated = manager
            .add_or_update_function_secret("KEY", Some("two"), Some("fn"))
            .await
            .unwrap();
        assert_eq!(updated.result, OperationResult::Updated);
        assert_eq!(updated.secret, "two");
        assert_eq!(persisted(&repo, ScriptSecretsType::Function, "fn").keys().count(), 1);
    }

    #[tokio::test]
    async fn add_is_visible_to_cached_reader() {
        let (_repo, manager) = manager();
        manager.get_function_secrets("fn", false).await.unwrap();
        manager
            .add_or_update_function_secret("extra", Some("value"), Some("fn"))
            .await
            .unwrap();
        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(keys["extra"], "value");
        assert!(keys.contains_key(DEFAULT_FUNCTION_KEY_NAME));
    }

    #[tokio::test]
    async fn host_scope_add_updates_host_function_keys() {
        let (_repo, manager) = manager();
        manager.get_host_secrets().await.unwrap();
        let result = manager
            .add_or_update_function_secret("shared", Some("s"), None)
            .await
            .unwrap();
        assert_eq!(result.result, OperationResult::Created);

        let host = manager.get_host_secrets().await.unwrap();
        assert_eq!(host.function_keys["shared"], "s");
        assert!(host.function_keys.contains_key(DEFAULT_FUNCTION_KEY_NAME));
    }

    #[tokio::test]
    async fn set_master_key_created_then_updated() {
        let (_repo, manager) = manager();
        let created = manager.set_master_key(None).await.unwrap();
        assert_eq!(created.result, OperationResult::Created);

        let before = manager.get_host_secrets().await.unwrap();
        assert_eq!(before.master_key, created.secret);

        let updated = manager.set_master_key(Some("explicit")).await.unwrap();
        assert_eq!(updated.result, OperationResult::Updated);
        assert_eq!(updated.secret, "explicit");

        let after = manager.get_host_secrets().await.unwrap();
        assert_eq!(after.master_key, "explicit");
        assert_eq!(after.function_keys, before.function_keys);
    }

    #[tokio::test]
    async fn delete_missing_key_does_not_write() {
        let (repo, manager) = manager();
        assert!(!manager.delete_secret("missing", Some("fn")).await.unwrap());
        assert_eq!(repo.write_count(), 0);

        manager.get_function_secrets("fn", false).await.unwrap();
        let writes = repo.write_count();
        assert!(!manager.delete_secret("missing", Some("fn")).await.unwrap());
        assert_eq!(repo.write_count(), writes);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let (_repo, manager) = manager();
        manager
            .add_or_update_function_secret("k", None, Some("fn"))
            .await
            .unwrap();
        manager.get_function_secrets("fn", false).await.unwrap();

        assert!(manager.delete_secret("k", Some("fn")).await.unwrap());
        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        assert!(!keys.contains_key("k"));
    }

    #[tokio::test]
    async fn deleting_last_key_keeps_empty_document() {
        let (repo, manager) = manager();
        manager.get_function_secrets("fn", false).await.unwrap();
        assert!(manager
            .delete_secret(DEFAULT_FUNCTION_KEY_NAME, Some("fn"))
            .await
            .unwrap());

        let doc = persisted(&repo, ScriptSecretsType::Function, "fn");
        assert_eq!(doc.keys().count(), 0);
        // An existing empty document is not regenerated.
        assert!(manager.get_function_secrets("fn", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_notification_forces_reload() {
        let (repo, manager) = manager();
        manager.get_function_secrets("fn", false).await.unwrap();
        repo.write(
            ScriptSecretsType::Function,
            "fn",
            r#"{"keys":[{"name":"default","value":"replaced"}]}"#,
        )
        .await
        .unwrap();

        // Silent write: the cached copy is still served.
        let cached = manager.get_function_secrets("fn", false).await.unwrap();
        assert_ne!(cached["default"], "replaced");
        assert_eq!(repo.read_count(), 1);

        manager.on_secrets_changed(&SecretsChanged::function("FN"));
        let reloaded = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(reloaded["default"], "replaced");
        assert_eq!(repo.read_count(), 2);
    }

    #[tokio::test]
    async fn external_change_is_picked_up_by_listener() {
        let (repo, manager) = manager();
        manager.get_host_secrets().await.unwrap();
        repo.external_write(
            ScriptSecretsType::Host,
            "",
            r#"{"masterKey":{"name":"master","value":"rotated"},"functionKeys":[]}"#,
        );

        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            if manager.get_host_secrets().await.unwrap().master_key == "rotated" {
                break;
            }
            assert!(time::Instant::now() < deadline, "listener never invalidated the cache");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn generated_keys_are_encrypted_when_ring_enabled() {
        let (repo, factory, manager) = encrypting_manager();
        let keys = manager.get_function_secrets("fn", false).await.unwrap();

        let doc = persisted(&repo, ScriptSecretsType::Function, "fn");
        let key = doc.get_function_key(DEFAULT_FUNCTION_KEY_NAME).unwrap();
        assert!(key.is_encrypted);
        assert_ne!(key.value, keys[DEFAULT_FUNCTION_KEY_NAME]);
        assert_eq!(
            key.encryption_key_id,
            factory.key_ring().active_id().map(|id| id.to_string())
        );
        // Freshly generated keys are not stale, so only one write happened.
        assert_eq!(repo.write_count(), 1);
    }

    #[tokio::test]
    async fn stale_keys_are_reencrypted_after_rotation() {
        let (repo, factory, manager) = encrypting_manager();
        let before = manager.get_function_secrets("fn", false).await.unwrap();
        let writes = repo.write_count();

        let new_id = factory
            .key_ring()
            .rotate(&hex::decode(OTHER_MATERIAL).unwrap())
            .unwrap();
        manager.on_secrets_changed(&SecretsChanged::function("fn"));

        let after = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(repo.write_count(), writes + 1);

        let doc = persisted(&repo, ScriptSecretsType::Function, "fn");
        let key = doc.get_function_key(DEFAULT_FUNCTION_KEY_NAME).unwrap();
        assert_eq!(key.encryption_key_id, Some(new_id.to_string()));
    }

    #[tokio::test]
    async fn plaintext_document_is_encrypted_on_read() {
        let (repo, _factory, manager) = encrypting_manager();
        repo.write(
            ScriptSecretsType::Function,
            "fn",
            r#"{"keys":[{"name":"default","value":"plain"}]}"#,
        )
        .await
        .unwrap();

        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(keys["default"], "plain");
        let doc = persisted(&repo, ScriptSecretsType::Function, "fn");
        assert!(doc.keys().all(|k| k.is_encrypted));
    }

    #[tokio::test]
    async fn malformed_document_is_format_error() {
        let (repo, manager) = manager();
        repo.write(ScriptSecretsType::Function, "fn", "{ nope").await.unwrap();
        assert!(matches!(
            manager.get_function_secrets("fn", false).await,
            Err(SecretsError::Format(_))
        ));
    }

    #[tokio::test]
    async fn read_failure_propagates() {
        let mut mock = mock_repository();
        mock.expect_read().returning(|_, _| Err(io_error()));
        let manager = SecretManager::new(
            Arc::new(mock),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        assert!(matches!(
            manager.get_host_secrets().await,
            Err(SecretsError::Io(_))
        ));
        assert!(!manager.has_cached_host_secrets());
    }

    #[tokio::test]
    async fn write_failure_propagates_and_caches_nothing() {
        let mut mock = mock_repository();
        mock.expect_read().returning(|_, _| Ok(None));
        mock.expect_write().returning(|_, _, _| Err(io_error()));
        let manager = SecretManager::new(
            Arc::new(mock),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        assert!(matches!(
            manager.get_function_secrets("fn", false).await,
            Err(SecretsError::Io(_))
        ));
        assert_eq!(manager.cached_function_count(), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_orphaned_function_documents() {
        let (repo, manager) = manager();
        let scripts = tempfile::tempdir().unwrap();
        std::fs::create_dir(scripts.path().join("Alive")).unwrap();
        std::fs::write(scripts.path().join("gone"), "not a directory").unwrap();

        manager.get_host_secrets().await.unwrap();
        manager.get_function_secrets("alive", false).await.unwrap();
        manager.get_function_secrets("gone", false).await.unwrap();

        manager.purge_old_files(scripts.path()).await;

        assert!(repo.document(ScriptSecretsType::Host, "").is_some());
        assert!(repo.document(ScriptSecretsType::Function, "alive").is_some());
        assert!(repo.document(ScriptSecretsType::Function, "gone").is_none());
        assert_eq!(manager.cached_function_count(), 1);
    }

    #[tokio::test]
    async fn purge_with_missing_script_root_deletes_nothing() {
        let (repo, manager) = manager();
        manager.get_function_secrets("fn", false).await.unwrap();
        let scripts = tempfile::tempdir().unwrap();

        manager.purge_old_files(&scripts.path().join("missing")).await;
        assert!(repo.document(ScriptSecretsType::Function, "fn").is_some());
    }

    #[tokio::test]
    async fn purge_swallows_repository_failures() {
        let scripts = tempfile::tempdir().unwrap();

        let mut mock = mock_repository();
        mock.expect_list_function_names().returning(|| Err(io_error()));
        mock.expect_delete().never();
        let manager = SecretManager::new(
            Arc::new(mock),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        manager.purge_old_files(scripts.path()).await;

        let mut mock = mock_repository();
        mock.expect_list_function_names()
            .returning(|| Ok(vec!["a".to_string(), "b".to_string()]));
        mock.expect_delete()
            .times(2)
            .returning(|_, _| Err(io_error()));
        let manager = SecretManager::new(
            Arc::new(mock),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        manager.purge_old_files(scripts.path()).await;
    }

    #[tokio::test]
    async fn purge_task_runs_immediately() {
        let (repo, manager) = manager();
        manager.get_function_secrets("orphan", false).await.unwrap();
        let scripts = tempfile::tempdir().unwrap();

        let task = purge_task(
            Arc::new(manager),
            scripts.path().to_path_buf(),
            Duration::from_secs(3600),
        );
        let deadline = time::Instant::now() + Duration::from_secs(5);
        while repo.document(ScriptSecretsType::Function, "orphan").is_some() {
            assert!(time::Instant::now() < deadline, "purge task never ran");
            time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
    }

    #[tokio::test]
    async fn abandoned_mutation_still_invalidates_cache() {
        let repo = Arc::new(SlowWrites::default());
        let manager = SecretManager::new(
            repo.clone(),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        manager.get_function_secrets("fn", false).await.unwrap();

        let attempt = time::timeout(
            Duration::from_millis(20),
            manager.add_or_update_function_secret("k", Some("v"), Some("fn")),
        )
        .await;
        assert!(attempt.is_err(), "write should still be in flight");

        time::sleep(Duration::from_millis(200)).await;
        assert!(repo.0.document(ScriptSecretsType::Function, "fn").unwrap().contains("\"k\""));
        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        assert_eq!(keys.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_converge() {
        let (repo, factory, manager) = encrypting_manager();
        let manager = Arc::new(manager);

        let mut hosts = Vec::new();
        let mut functions = Vec::new();
        for _ in 0..16 {
            let m = manager.clone();
            hosts.push(tokio::spawn(async move { m.get_host_secrets().await }));
            let m = manager.clone();
            functions.push(tokio::spawn(async move { m.get_function_secrets("fn", false).await }));
        }
        let mut host_results = Vec::new();
        for t in hosts {
            host_results.push(t.await.unwrap().unwrap());
        }
        let mut function_results = Vec::new();
        for t in functions {
            function_results.push(t.await.unwrap().unwrap());
        }

        // Generated once per scope, and every caller saw the plaintext values.
        assert_eq!(repo.write_count(), 2);
        for host in &host_results {
            assert_eq!(host.master_key, host_results[0].master_key);
            assert_eq!(host.master_key.len(), 56);
            assert_eq!(host.function_keys, host_results[0].function_keys);
        }
        for keys in &function_results {
            assert_eq!(keys, &function_results[0]);
            assert_eq!(keys[DEFAULT_FUNCTION_KEY_NAME].len(), 56);
        }

        // The cache agrees with what a fresh reader decrypts from storage.
        let fresh = SecretManager::new(repo.clone(), factory.clone());
        let cached = manager.get_host_secrets().await.unwrap();
        let stored = fresh.get_host_secrets().await.unwrap();
        assert_eq!(cached.master_key, stored.master_key);
        assert_eq!(cached.function_keys, stored.function_keys);
        assert_eq!(
            manager.get_function_secrets("fn", false).await.unwrap(),
            fresh.get_function_secrets("fn", false).await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_are_never_lost_from_cache() {
        let (_repo, manager) = manager();
        let manager = Arc::new(manager);
        manager.get_function_secrets("fn", false).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let m = manager.clone();
            tasks.push(tokio::spawn(async move {
                m.add_or_update_function_secret(&format!("k{i}"), Some("v"), Some("fn"))
                    .await
                    .map(|_| ())
            }));
            let m = manager.clone();
            tasks.push(tokio::spawn(async move {
                m.get_function_secrets("fn", true).await.map(|_| ())
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let keys = manager.get_function_secrets("fn", false).await.unwrap();
        for i in 0..8 {
            assert_eq!(keys.get(&format!("k{i}")).map(String::as_str), Some("v"));
        }
        assert!(keys.contains_key(DEFAULT_FUNCTION_KEY_NAME));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn purge_keeps_functions_behind_symlinks() {
        let (repo, manager) = manager();
        let scripts = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(target.path(), scripts.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(scripts.path().join("nowhere"), scripts.path().join("dangling"))
            .unwrap();

        manager.get_function_secrets("linked", false).await.unwrap();
        manager.get_function_secrets("dangling", false).await.unwrap();
        manager.purge_old_files(scripts.path()).await;

        assert!(repo.document(ScriptSecretsType::Function, "linked").is_some());
        assert!(repo.document(ScriptSecretsType::Function, "dangling").is_none());
    }

    #[tokio::test]
    async fn purge_removes_mixed_case_orphans_from_disk() {
        let secrets = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        let repo = Arc::new(FileSystemSecretsRepository::open(secrets.path()).await.unwrap());
        let manager = SecretManager::new(
            repo.clone(),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        std::fs::write(secrets.path().join("Orphan.json"), r#"{"keys":[]}"#).unwrap();

        manager.purge_old_files(scripts.path()).await;
        assert!(!secrets.path().join("Orphan.json").exists());
        assert!(repo.list_function_names().await.unwrap().is_empty());
    }
}
