//! [`SecretsCache`]: resolved host and function secrets.
//!
//! Reads are lock-free (`arc-swap`). Publishing and invalidation serialise on
//! a small mutex so that a resolve which started before an invalidation can
//! never overwrite it: every invalidation bumps a generation counter, and a
//! publish only lands when the generation it observed at the start of its
//! resolve is still current.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::{ArcSwap, ArcSwapOption};
use common::protocol::HostSecretsInfo;

/// Plaintext key name → value for one function.
pub type ResolvedKeys = Arc<HashMap<String, String>>;

pub struct SecretsCache {
    host: ArcSwapOption<HostSecretsInfo>,
    functions: ArcSwap<HashMap<String, ResolvedKeys>>,
    generation: AtomicU64,
    writer: Mutex<()>,
}

impl SecretsCache {
    pub fn new() -> Self {
        Self {
            host: ArcSwapOption::empty(),
            functions: ArcSwap::from_pointee(HashMap::new()),
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Token to pass to `publish_*` after resolving.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn host(&self) -> Option<Arc<HostSecretsInfo>> {
        self.host.load_full()
    }

    pub fn function(&self, name: &str) -> Option<ResolvedKeys> {
        self.functions.load().get(name).cloned()
    }

    pub fn has_host(&self) -> bool {
        self.host.load().is_some()
    }

    pub fn function_count(&self) -> usize {
        self.functions.load().len()
    }

    /// Cache `info` unless something was invalidated since `generation`.
    /// Returns the value either way.
    pub fn publish_host(&self, generation: u64, info: HostSecretsInfo) -> Arc<HostSecretsInfo> {
        let info = Arc::new(info);
        let _guard = self.lock();
        if self.generation() == generation {
            self.host.store(Some(info.clone()));
        }
        info
    }

    /// Cache `keys` for `name` unless something was invalidated since
    /// `generation`. Returns the value either way.
    pub fn publish_function(
        &self,
        generation: u64,
        name: &str,
        keys: HashMap<String, String>,
    ) -> ResolvedKeys {
        let keys = Arc::new(keys);
        let _guard = self.lock();
        if self.generation() == generation {
            let mut next = HashMap::clone(&self.functions.load());
            next.insert(name.to_owned(), keys.clone());
            self.functions.store(Arc::new(next));
        }
        keys
    }

    pub fn invalidate_host(&self) {
        let _guard = self.lock();
        self.bump();
        self.host.store(None);
    }

    pub fn invalidate_function(&self, name: &str) {
        let _guard = self.lock();
        self.bump();
        if self.functions.load().contains_key(name) {
            let mut next = HashMap::clone(&self.functions.load());
            next.remove(name);
            self.functions.store(Arc::new(next));
        }
    }

    pub fn invalidate_all(&self) {
        let _guard = self.lock();
        self.bump();
        self.host.store(None);
        self.functions.store(Arc::new(HashMap::new()));
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SecretsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecretsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.functions.load().keys().cloned().collect();
        names.sort();
        f.debug_struct("SecretsCache")
            .field("host", &self.has_host())
            .field("functions", &names)
            .field("generation", &self.generation())
            .finish()
    }
}
