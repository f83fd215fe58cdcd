//! `functions-host`: secrets host binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Build the encryption key ring.
//! 4. Open the secrets repository and start watching it for changes.
//! 5. Build the [`SecretManager`], creating host secrets if configured to.
//! 6. Spawn the background purge of orphaned function secrets.
//! 7. Build the Axum router and start the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use host::config::Config;
use host::convert::DefaultKeyValueConverterFactory;
use host::manager::{purge_task, SecretManager};
use host::repository::FileSystemSecretsRepository;
use host::server::{self, state::AppState};
use host::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otlp_endpoint(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        "functions-host starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key ring
    // -----------------------------------------------------------------------
    let ring = cfg.key_ring()?;
    info!(
        encryption_enabled = ring.is_enabled(),
        active_key_id = ?ring.active_id(),
        "key ring initialised"
    );
    let converters = Arc::new(DefaultKeyValueConverterFactory::new(ring));

    // -----------------------------------------------------------------------
    // 4. Repository + watcher
    // -----------------------------------------------------------------------
    let repository = Arc::new(
        FileSystemSecretsRepository::open(&cfg.secrets_path)
            .await
            .context("failed to open secrets directory")?,
    );
    let _watcher = repository
        .watch(cfg.watch_interval())
        .await
        .context("failed to start secrets watcher")?;

    // -----------------------------------------------------------------------
    // 5. Secret manager
    // -----------------------------------------------------------------------
    let manager = Arc::new(
        SecretManager::with_host_secrets(
            repository,
            converters,
            cfg.create_host_secrets_if_missing,
        )
        .await
        .context("failed to initialise host secrets")?,
    );

    // -----------------------------------------------------------------------
    // 6. Background tasks
    // -----------------------------------------------------------------------
    let _purge = purge_task(
        manager.clone(),
        PathBuf::from(&cfg.script_path),
        cfg.purge_interval(),
    );

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(manager, cfg.signing_key()?, cfg.auth_disabled);
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, auth_disabled = cfg.auth_disabled, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
