//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::convert::DefaultKeyValueConverterFactory;
use crate::manager::SecretManager;
use crate::repository::MemorySecretsRepository;
use crate::token::SigningKey;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable so that Axum can clone the state for each
/// request without copying expensive data.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Resolves and mutates secrets; also the source of the master key used
    /// to authorise admin requests.
    pub manager: Arc<SecretManager>,
    /// Key for `POST /admin/token`. Token issuance is unavailable without it.
    pub signing_key: Option<Arc<SigningKey>>,
    /// Skip the master key check on admin routes.
    pub auth_disabled: bool,
}

impl AppState {
    pub fn new(
        manager: Arc<SecretManager>,
        signing_key: Option<SigningKey>,
        auth_disabled: bool,
    ) -> Self {
        Self {
            manager,
            signing_key: signing_key.map(Arc::new),
            auth_disabled,
        }
    }

    /// State backed by an empty in-memory repository with plaintext storage,
    /// suitable for tests. Must be called from within a Tokio runtime.
    pub fn in_memory() -> Self {
        let manager = SecretManager::new(
            Arc::new(MemorySecretsRepository::new()),
            Arc::new(DefaultKeyValueConverterFactory::plaintext()),
        );
        Self::new(Arc::new(manager), None, false)
    }
}
