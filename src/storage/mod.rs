//! Keyed metric tables and their durability.
//!
//! Every backend implements [`MetricStore`]: gauges are overwritten,
//! counters accumulate. Backends own their locking; callers only ever see
//! atomic operations and snapshot copies.

pub mod backup;
pub mod error;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};

pub use backup::{Backup, PersistenceMode};
pub use error::{Result, StorageError};
pub use memory::MemStorage;
pub use sqlite::SqliteStorage;

/// The capability set shared by the in-memory and relational backends.
///
/// Merge rules:
/// * `Gauge` replaces the stored value.
/// * `Counter` adds its delta, creating the key with `value = delta`.
///
/// Counter merging is not idempotent: a redelivered record is counted twice.
pub trait MetricStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Apply one record.
    fn merge(&self, record: &MetricRecord) -> Result<()>;

    /// Apply a batch all-or-nothing where the backend supports it.
    fn merge_batch(&self, records: &[MetricRecord]) -> Result<()>;

    /// Current value of `(kind, id)`, or [`StorageError::NotFound`].
    fn get(&self, kind: MetricKind, id: &str) -> Result<MetricValue>;

    /// Set an existing counter back to zero. Missing keys are not an error.
    fn reset_counter(&self, id: &str) -> Result<()>;

    /// Copy of the whole table.
    fn snapshot(&self) -> Result<MetricsPack>;

    /// Snapshot and zero every counter. The default is not atomic with
    /// respect to concurrent writers; backends that can do better override it.
    fn take_snapshot(&self) -> Result<MetricsPack> {
        let pack = self.snapshot()?;
        for record in &pack.metrics {
            if record.kind() == MetricKind::Counter {
                self.reset_counter(&record.id)?;
            }
        }
        Ok(pack)
    }

    /// Backend health.
    fn ping(&self) -> Result<()>;
}

/// Open the backend selected by configuration.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn MetricStore>> {
    match &config.database_dsn {
        Some(dsn) => {
            let store = SqliteStorage::open(dsn, config.retry)?;
            tracing::info!(dsn = %dsn, "using relational metric store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("using in-memory metric store");
            Ok(Arc::new(MemStorage::new()))
        }
    }
}
