use std::collections::HashMap;

use parking_lot::RwLock;

use super::{MetricStore, Result, StorageError};
use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};

/// Thread-safe in-memory table.
/// Readers share the lock; every write holds it exclusively.
#[derive(Default)]
pub struct MemStorage {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl Inner {
    /// Apply `records` all-or-nothing. Counter sums are checked first so an
    /// overflowing delta leaves every key untouched.
    fn apply(&mut self, records: &[MetricRecord]) -> Result<()> {
        let mut sums: HashMap<&str, i64> = HashMap::new();
        for record in records {
            if let MetricValue::Counter(d) = record.value {
                let current = match sums.get(record.id.as_str()) {
                    Some(v) => *v,
                    None => self.counters.get(&record.id).copied().unwrap_or(0),
                };
                let next = current
                    .checked_add(d)
                    .ok_or_else(|| StorageError::counter_overflow(&record.id))?;
                sums.insert(&record.id, next);
            }
        }

        for record in records {
            if let MetricValue::Gauge(v) = record.value {
                self.gauges.insert(record.id.clone(), v);
            }
        }
        for (id, sum) in sums {
            self.counters.insert(id.to_string(), sum);
        }
        Ok(())
    }

    fn records(&self) -> Vec<MetricRecord> {
        self.gauges
            .iter()
            .map(|(id, v)| MetricRecord::gauge(id.clone(), *v))
            .chain(
                self.counters
                    .iter()
                    .map(|(id, d)| MetricRecord::counter(id.clone(), *d)),
            )
            .collect()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.gauges.len() + inner.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricStore for MemStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn merge(&self, record: &MetricRecord) -> Result<()> {
        self.inner.write().apply(std::slice::from_ref(record))
    }

    /// One lock acquisition for the whole batch.
    fn merge_batch(&self, records: &[MetricRecord]) -> Result<()> {
        self.inner.write().apply(records)
    }

    fn get(&self, kind: MetricKind, id: &str) -> Result<MetricValue> {
        let inner = self.inner.read();
        let found = match kind {
            MetricKind::Gauge => inner.gauges.get(id).copied().map(MetricValue::Gauge),
            MetricKind::Counter => inner.counters.get(id).copied().map(MetricValue::Counter),
        };
        found.ok_or_else(|| StorageError::not_found(kind, id))
    }

    fn reset_counter(&self, id: &str) -> Result<()> {
        if let Some(slot) = self.inner.write().counters.get_mut(id) {
            *slot = 0;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<MetricsPack> {
        Ok(MetricsPack::new(self.inner.read().records()))
    }

    /// Snapshot and zero counters under a single write lock, so no
    /// increment lands between the copy and the reset.
    fn take_snapshot(&self) -> Result<MetricsPack> {
        let mut inner = self.inner.write();
        let records = inner.records();
        for slot in inner.counters.values_mut() {
            *slot = 0;
        }
        Ok(MetricsPack::new(records))
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn gauge_keeps_last_write() {
        let store = MemStorage::new();
        for v in [100.0, 7.0, 42.0] {
            store.merge(&MetricRecord::gauge("Alloc", v)).unwrap();
        }
        assert_eq!(
            store.get(MetricKind::Gauge, "Alloc").unwrap(),
            MetricValue::Gauge(42.0)
        );
    }

    #[test]
    fn counter_sums_deltas_in_any_order() {
        let deltas = [5i64, -2, 11, 1, 0, 3];
        let forward = MemStorage::new();
        let backward = MemStorage::new();
        for d in deltas {
            forward.merge(&MetricRecord::counter("c", d)).unwrap();
        }
        for d in deltas.iter().rev() {
            backward.merge(&MetricRecord::counter("c", *d)).unwrap();
        }
        let expected = MetricValue::Counter(deltas.iter().sum());
        assert_eq!(forward.get(MetricKind::Counter, "c").unwrap(), expected);
        assert_eq!(backward.get(MetricKind::Counter, "c").unwrap(), expected);
    }

    #[test]
    fn counter_overflow_is_refused_without_partial_writes() {
        let store = MemStorage::new();
        store.merge(&MetricRecord::counter("big", i64::MAX)).unwrap();

        let err = store.merge(&MetricRecord::counter("big", 1)).unwrap_err();
        assert!(matches!(err, StorageError::CounterOverflow { ref id } if id == "big"));

        let err = store
            .merge_batch(&[
                MetricRecord::gauge("g", 1.0),
                MetricRecord::counter("small", 1),
                MetricRecord::counter("big", 1),
            ])
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(store.get(MetricKind::Gauge, "g").unwrap_err().is_not_found());
        assert!(store.get(MetricKind::Counter, "small").unwrap_err().is_not_found());
        assert_eq!(
            store.get(MetricKind::Counter, "big").unwrap(),
            MetricValue::Counter(i64::MAX)
        );

        store.merge(&MetricRecord::counter("big", -1)).unwrap();
        assert_eq!(
            store.get(MetricKind::Counter, "big").unwrap(),
            MetricValue::Counter(i64::MAX - 1)
        );
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = MemStorage::new();
        store.merge(&MetricRecord::gauge("x", 1.0)).unwrap();
        let err = store.get(MetricKind::Counter, "x").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn reset_zeroes_existing_counter_only() {
        let store = MemStorage::new();
        store.merge(&MetricRecord::counter("PollCount", 9)).unwrap();
        store.reset_counter("PollCount").unwrap();
        store.reset_counter("Unknown").unwrap();
        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(0)
        );
        assert!(store.get(MetricKind::Counter, "Unknown").is_err());
    }

    #[test]
    fn take_snapshot_returns_counts_and_zeroes_them() {
        let store = MemStorage::new();
        store.merge(&MetricRecord::counter("PollCount", 3)).unwrap();
        store.merge(&MetricRecord::gauge("RandomValue", 0.5)).unwrap();

        let pack = store.take_snapshot().unwrap();
        assert!(pack.metrics.contains(&MetricRecord::counter("PollCount", 3)));
        assert!(pack.metrics.contains(&MetricRecord::gauge("RandomValue", 0.5)));

        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(0)
        );
        assert_eq!(
            store.get(MetricKind::Gauge, "RandomValue").unwrap(),
            MetricValue::Gauge(0.5)
        );
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let store = MemStorage::new();
        store
            .merge_batch(&[
                MetricRecord::gauge("Alloc", 12.5),
                MetricRecord::counter("PollCount", 4),
            ])
            .unwrap();

        let json = serde_json::to_vec(&store.snapshot().unwrap()).unwrap();
        let restored = MemStorage::new();
        restored
            .merge_batch(&serde_json::from_slice::<MetricsPack>(&json).unwrap().metrics)
            .unwrap();

        assert_eq!(restored.snapshot().unwrap(), store.snapshot().unwrap());
    }

    #[test]
    fn concurrent_counter_writers_do_not_lose_updates() {
        let store = Arc::new(MemStorage::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.merge(&MetricRecord::counter("hits", 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            store.get(MetricKind::Counter, "hits").unwrap(),
            MetricValue::Counter(8000)
        );
    }
}
