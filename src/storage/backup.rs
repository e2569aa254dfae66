use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{MetricStore, Result, StorageError};
use crate::model::MetricsPack;

/// How the server makes a non-durable store durable. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Export the whole store after every successful write.
    Sync,
    /// Export on a background timer.
    Periodic(Duration),
    /// The backend is durable itself; no file export.
    Delegated,
}

impl PersistenceMode {
    pub fn exports_to_file(&self) -> bool {
        !matches!(self, Self::Delegated)
    }
}

/// A backup file holding one [`MetricsPack`] document.
///
/// Exports are serialized so a slower writer can never replace a newer
/// snapshot with an older one.
pub struct Backup {
    path: PathBuf,
    export_lock: Mutex<()>,
}

impl Backup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            export_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full store to the backup file. The document goes to a
    /// temporary file in the same directory first and is renamed over the
    /// target, so readers never observe a half-written file.
    pub fn export(&self, store: &dyn MetricStore) -> Result<usize> {
        let _guard = self.export_lock.lock();
        let pack = store.snapshot()?;
        let body = serde_json::to_vec(&pack)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StorageError::Io(e.error))?;

        tracing::debug!(path = %self.path.display(), metrics = pack.len(), "exported store");
        Ok(pack.len())
    }

    /// Merge the backup file into `store`. A missing file is a fresh start,
    /// not an error.
    pub fn restore(&self, store: &dyn MetricStore) -> Result<usize> {
        let body = match std::fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no backup file, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let pack: MetricsPack = serde_json::from_slice(&body)?;
        store.merge_batch(&pack.metrics)?;
        tracing::info!(path = %self.path.display(), metrics = pack.len(), "restored store");
        Ok(pack.len())
    }
}

/// Export on a blocking thread so the runtime workers stay free.
pub async fn export_blocking(backup: Arc<Backup>, store: Arc<dyn MetricStore>) -> Result<usize> {
    tokio::task::spawn_blocking(move || backup.export(store.as_ref()))
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

/// Periodic exporter. Runs until `token` is cancelled; the final export on
/// shutdown is the caller's job.
pub async fn run_periodic(
    backup: Arc<Backup>,
    store: Arc<dyn MetricStore>,
    every: Duration,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("periodic exporter stopped");
                return;
            }
            _ = tick.tick() => {
                if let Err(e) = export_blocking(backup.clone(), store.clone()).await {
                    tracing::error!(error = %e, path = %backup.path().display(), "periodic export failed");
                }
            }
        }
    }
}
