//! Polling watcher for the secrets directory.
//!
//! On every tick the directory is scanned and each `*.json` file is
//! fingerprinted by modification time and length. Any file that appeared,
//! disappeared, or changed fingerprint since the previous scan produces a
//! [`SecretsChanged`] event. Temp files written during atomic replaces start
//! with a `.` and are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use common::secrets::HOST_SECRETS_FILE_NAME;
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SecretsChanged;

/// Fingerprint of one file: modification time and length.
pub type Fingerprint = (Option<SystemTime>, u64);

/// Lowercased file name → fingerprint.
pub type Snapshot = HashMap<String, Fingerprint>;

/// Map a file name in the secrets directory to the document it holds.
///
/// Returns `None` for anything that is not a secrets document.
pub fn change_for_file(file_name: &str) -> Option<SecretsChanged> {
    if file_name.starts_with('.') {
        return None;
    }
    if file_name.eq_ignore_ascii_case(HOST_SECRETS_FILE_NAME) {
        return Some(SecretsChanged::host());
    }
    let lower = file_name.to_lowercase();
    let stem = lower.strip_suffix(".json")?;
    if stem.is_empty() {
        return None;
    }
    Some(SecretsChanged::function(stem))
}

/// Fingerprint every secrets document in `dir`.
pub async fn scan(dir: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_lowercase();
        if change_for_file(&file_name).is_none() {
            continue;
        }
        // The file may vanish between listing and stat; treat it as absent.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        snapshot.insert(file_name, (meta.modified().ok(), meta.len()));
    }
    Ok(snapshot)
}

/// Events for every file that differs between two snapshots.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<SecretsChanged> {
    let mut changed: Vec<SecretsChanged> = current
        .iter()
        .filter(|(name, fp)| previous.get(*name) != Some(*fp))
        .chain(previous.iter().filter(|(name, _)| !current.contains_key(*name)))
        .filter_map(|(name, _)| change_for_file(name))
        .collect();
    changed.sort_by(|a, b| a.name.cmp(&b.name));
    changed.dedup();
    changed
}

/// Spawn the polling task.
///
/// `baseline` is the snapshot taken before spawning, so that changes made
/// right after this call are never folded into the initial state. The task
/// stops when `cancel` fires. Scan failures (e.g. the directory being
/// recreated) are logged and retried on the next tick.
pub fn spawn(
    dir: PathBuf,
    baseline: Snapshot,
    changes: broadcast::Sender<SecretsChanged>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick fires immediately; the baseline already covers it.
        ticker.tick().await;
        let mut previous = baseline;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(dir = %dir.display(), "secrets watcher stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let current = match scan(&dir).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "secrets directory scan failed");
                    continue;
                }
            };

            for change in diff(&previous, &current) {
                debug!(secrets_type = %change.secrets_type, name = %change.name, "secrets document changed");
                // No subscribers is fine; nothing is cached anywhere.
                let _ = changes.send(change);
            }
            previous = current;
        }
    })
}
