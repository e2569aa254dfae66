use std::sync::Arc;

use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};
use crate::storage::backup::export_blocking;
use crate::storage::{Backup, MetricStore, PersistenceMode, Result, StorageError};

/// Server-side entry point into the store.
///
/// Store calls run on the blocking pool (the relational backend sleeps
/// between retries). In [`PersistenceMode::Sync`] every successful write is
/// followed by a full export.
#[derive(Clone)]
pub struct MetricService {
    store: Arc<dyn MetricStore>,
    backup: Option<Arc<Backup>>,
    mode: PersistenceMode,
}

impl MetricService {
    pub fn new(store: Arc<dyn MetricStore>, backup: Option<Arc<Backup>>, mode: PersistenceMode) -> Self {
        Self { store, backup, mode }
    }

    /// Service over a plain store with no file persistence.
    pub fn ephemeral(store: Arc<dyn MetricStore>) -> Self {
        Self::new(store, None, PersistenceMode::Delegated)
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    /// Merge one record and return the value now stored under its key.
    pub async fn update(&self, record: MetricRecord) -> Result<MetricRecord> {
        let kind = record.kind();
        let id = record.id.clone();
        let value = self
            .blocking(move |store| {
                store.merge(&record)?;
                store.get(kind, &record.id)
            })
            .await?;
        self.after_write().await;
        Ok(MetricRecord { id, value })
    }

    /// Merge a whole pack; all-or-nothing on the relational backend.
    pub async fn update_batch(&self, records: Vec<MetricRecord>) -> Result<usize> {
        let count = records.len();
        self.blocking(move |store| store.merge_batch(&records)).await?;
        self.after_write().await;
        Ok(count)
    }

    pub async fn value(&self, kind: MetricKind, id: &str) -> Result<MetricValue> {
        let id = id.to_string();
        self.blocking(move |store| store.get(kind, &id)).await
    }

    pub async fn snapshot(&self) -> Result<MetricsPack> {
        self.blocking(|store| store.snapshot()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.blocking(|store| store.ping()).await
    }

    /// Export regardless of mode. Used for the final flush on shutdown.
    pub async fn export(&self) -> Result<usize> {
        match &self.backup {
            Some(backup) => export_blocking(backup.clone(), self.store.clone()).await,
            None => Ok(0),
        }
    }

    pub async fn restore(&self) -> Result<usize> {
        match &self.backup {
            Some(backup) => {
                let backup = backup.clone();
                self.blocking(move |store| backup.restore(store)).await
            }
            None => Ok(0),
        }
    }

    async fn after_write(&self) {
        if self.mode != PersistenceMode::Sync {
            return;
        }
        // The write already succeeded; a failed export must not fail it.
        if let Err(e) = self.export().await {
            tracing::error!(error = %e, "synchronous export failed");
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetricStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn update_returns_stored_value() {
        let service = MetricService::ephemeral(Arc::new(MemStorage::new()));
        service.update(MetricRecord::counter("PollCount", 1)).await.unwrap();
        let stored = service.update(MetricRecord::counter("PollCount", 1)).await.unwrap();
        assert_eq!(stored, MetricRecord::counter("PollCount", 2));
    }

    #[tokio::test]
    async fn value_of_missing_metric_is_not_found() {
        let service = MetricService::ephemeral(Arc::new(MemStorage::new()));
        let err = service.value(MetricKind::Gauge, "Alloc").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn sync_mode_exports_after_each_write() {
        let dir = TempDir::new().unwrap();
        let backup = Arc::new(Backup::new(dir.path().join("backup.json")));
        let service = MetricService::new(
            Arc::new(MemStorage::new()),
            Some(backup.clone()),
            PersistenceMode::Sync,
        );

        service.update(MetricRecord::gauge("Alloc", 100.0)).await.unwrap();
        service.update(MetricRecord::gauge("Alloc", 42.0)).await.unwrap();

        let restored = MemStorage::new();
        backup.restore(&restored).unwrap();
        assert_eq!(
            restored.get(MetricKind::Gauge, "Alloc").unwrap(),
            MetricValue::Gauge(42.0)
        );
    }

    #[tokio::test]
    async fn periodic_mode_does_not_export_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.json");
        let service = MetricService::new(
            Arc::new(MemStorage::new()),
            Some(Arc::new(Backup::new(&path))),
            PersistenceMode::Periodic(std::time::Duration::from_secs(300)),
        );
        service.update(MetricRecord::gauge("Alloc", 1.0)).await.unwrap();
        assert!(!path.exists());

        assert_eq!(service.export().await.unwrap(), 1);
        assert!(path.exists());
    }
}
