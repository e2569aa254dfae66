use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{MetricStore, Result, StorageError};
use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};
use crate::retry::{Retrier, RetryPolicy};

const METRICS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    metric_type TEXT NOT NULL CHECK (metric_type IN ('GAUGE', 'COUNTER')),
    metric_name TEXT NOT NULL,
    delta INTEGER,
    value REAL,
    PRIMARY KEY (metric_type, metric_name)
);
";

const UPSERT_GAUGE: &str = "
INSERT INTO metrics (metric_type, metric_name, value) VALUES ('GAUGE', ?1, ?2)
ON CONFLICT (metric_type, metric_name) DO UPDATE SET value = excluded.value";

const SELECT_COUNTER: &str =
    "SELECT delta FROM metrics WHERE metric_type = 'COUNTER' AND metric_name = ?1";

const UPSERT_COUNTER: &str = "
INSERT INTO metrics (metric_type, metric_name, delta) VALUES ('COUNTER', ?1, ?2)
ON CONFLICT (metric_type, metric_name) DO UPDATE SET delta = metrics.delta + excluded.delta";

/// Relational backend on a single SQLite connection.
///
/// Every statement runs through the [`Retrier`]; the connection lock is
/// taken per attempt and never held across a backoff sleep.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    retrier: Retrier,
}

impl SqliteStorage {
    /// Open (or create) the database at `dsn`. `":memory:"` gives a
    /// private in-memory database, which the tests use.
    pub fn open(dsn: &str, policy: RetryPolicy) -> Result<Self> {
        let retrier = Retrier::new(policy);
        let conn = retrier.retry(|| Connection::open(dsn))?;
        conn.busy_timeout(std::time::Duration::from_secs(1))?;
        conn.execute_batch(METRICS_SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
            retrier,
        };
        store.ping()?;
        Ok(store)
    }

    /// Like [`with_retry`](Self::with_retry) for operations that can also
    /// refuse their input. A refusal is returned as the inner error and
    /// ends the retry loop.
    fn with_retry_checked<T>(
        &self,
        op: impl FnMut(&mut Connection) -> rusqlite::Result<Result<T>>,
    ) -> Result<T> {
        self.with_retry(op)?
    }

    fn with_retry<T>(&self, mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        self.retrier
            .retry(|| {
                let mut conn = self.conn.lock();
                op(&mut conn)
            })
            .map_err(StorageError::from)
    }
}

fn kind_label(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Gauge => "GAUGE",
        MetricKind::Counter => "COUNTER",
    }
}

/// SQLite silently turns an overflowing integer sum into REAL, so the new
/// counter value is checked here before the upsert runs.
fn upsert(conn: &Connection, record: &MetricRecord) -> rusqlite::Result<Result<()>> {
    match record.value {
        MetricValue::Gauge(v) => {
            conn.prepare_cached(UPSERT_GAUGE)?
                .execute(params![&record.id, v])?;
        }
        MetricValue::Counter(d) => {
            let current = conn
                .prepare_cached(SELECT_COUNTER)?
                .query_row(params![&record.id], |row| row.get::<_, Option<i64>>(0))
                .optional()?
                .flatten()
                .unwrap_or(0);
            if current.checked_add(d).is_none() {
                return Ok(Err(StorageError::counter_overflow(&record.id)));
            }
            conn.prepare_cached(UPSERT_COUNTER)?
                .execute(params![&record.id, d])?;
        }
    }
    Ok(Ok(()))
}

fn read_all(conn: &Connection) -> rusqlite::Result<Vec<MetricRecord>> {
    let mut stmt =
        conn.prepare_cached("SELECT metric_type, metric_name, delta, value FROM metrics")?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(0)?;
        let id: String = row.get(1)?;
        let delta: Option<i64> = row.get(2)?;
        let value: Option<f64> = row.get(3)?;
        Ok((kind, id, delta, value))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (kind, id, delta, value) = row?;
        match kind.as_str() {
            "GAUGE" => records.push(MetricRecord::gauge(id, value.unwrap_or_default())),
            "COUNTER" => records.push(MetricRecord::counter(id, delta.unwrap_or_default())),
            other => tracing::warn!(metric = %id, kind = other, "skipping row with unknown kind"),
        }
    }
    Ok(records)
}

impl MetricStore for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn merge(&self, record: &MetricRecord) -> Result<()> {
        self.with_retry_checked(|conn| {
            let tx = conn.transaction()?;
            if let Err(refused) = upsert(&tx, record)? {
                return Ok(Err(refused));
            }
            tx.commit()?;
            Ok(Ok(()))
        })
    }

    /// One transaction per batch; the transaction is what gets retried.
    /// A refused record rolls the whole batch back.
    fn merge_batch(&self, records: &[MetricRecord]) -> Result<()> {
        self.with_retry_checked(|conn| {
            let tx = conn.transaction()?;
            for record in records {
                if let Err(refused) = upsert(&tx, record)? {
                    return Ok(Err(refused));
                }
            }
            tx.commit()?;
            Ok(Ok(()))
        })
    }

    fn get(&self, kind: MetricKind, id: &str) -> Result<MetricValue> {
        let found = self.with_retry(|conn| {
            conn.prepare_cached(
                "SELECT delta, value FROM metrics WHERE metric_type = ?1 AND metric_name = ?2",
            )?
            .query_row(params![kind_label(kind), id], |row| {
                Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<f64>>(1)?))
            })
            .optional()
        })?;

        match (kind, found) {
            (MetricKind::Gauge, Some((_, Some(v)))) => Ok(MetricValue::Gauge(v)),
            (MetricKind::Counter, Some((Some(d), _))) => Ok(MetricValue::Counter(d)),
            _ => Err(StorageError::not_found(kind, id)),
        }
    }

    fn reset_counter(&self, id: &str) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE metrics SET delta = 0 WHERE metric_type = 'COUNTER' AND metric_name = ?1",
                params![id],
            )
        })?;
        Ok(())
    }

    fn snapshot(&self) -> Result<MetricsPack> {
        self.with_retry(|conn| read_all(conn)).map(MetricsPack::new)
    }

    fn take_snapshot(&self) -> Result<MetricsPack> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            let records = read_all(&tx)?;
            tx.execute("UPDATE metrics SET delta = 0 WHERE metric_type = 'COUNTER'", [])?;
            tx.commit()?;
            Ok(records)
        })
        .map(MetricsPack::new)
    }

    fn ping(&self) -> Result<()> {
        self.with_retry(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_store() -> SqliteStorage {
        SqliteStorage::open(":memory:", RetryPolicy::none()).unwrap()
    }

    #[test]
    fn gauge_upsert_overwrites() {
        let store = memory_store();
        store.merge(&MetricRecord::gauge("Alloc", 100.0)).unwrap();
        store.merge(&MetricRecord::gauge("Alloc", 42.0)).unwrap();
        assert_eq!(
            store.get(MetricKind::Gauge, "Alloc").unwrap(),
            MetricValue::Gauge(42.0)
        );
    }

    #[test]
    fn counter_upsert_accumulates() {
        let store = memory_store();
        store.merge(&MetricRecord::counter("PollCount", 1)).unwrap();
        store.merge(&MetricRecord::counter("PollCount", 1)).unwrap();
        store.merge(&MetricRecord::counter("PollCount", 5)).unwrap();
        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(7)
        );
    }

    #[test]
    fn unknown_key_is_not_found() {
        let store = memory_store();
        assert!(store.get(MetricKind::Gauge, "nope").unwrap_err().is_not_found());
    }

    #[test]
    fn batch_applies_in_one_transaction() {
        let store = memory_store();
        store
            .merge_batch(&[
                MetricRecord::gauge("a", 1.0),
                MetricRecord::counter("b", 2),
                MetricRecord::counter("b", 3),
            ])
            .unwrap();
        let pack = store.snapshot().unwrap();
        assert_eq!(
            pack.metrics,
            vec![MetricRecord::gauge("a", 1.0), MetricRecord::counter("b", 5)]
        );
    }

    #[test]
    fn failed_batch_leaves_table_unchanged() {
        let store = memory_store();
        store.merge(&MetricRecord::counter("b", 1)).unwrap();
        store
            .conn
            .lock()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON metrics
                 WHEN NEW.metric_name = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
            )
            .unwrap();

        let err = store.merge_batch(&[
            MetricRecord::counter("b", 10),
            MetricRecord::gauge("poison", 1.0),
        ]);
        assert!(err.is_err());
        assert_eq!(
            store.get(MetricKind::Counter, "b").unwrap(),
            MetricValue::Counter(1)
        );
    }

    #[test]
    fn counter_overflow_is_refused_and_rolled_back() {
        let store = memory_store();
        store.merge(&MetricRecord::counter("big", i64::MAX)).unwrap();

        let err = store.merge(&MetricRecord::counter("big", 1)).unwrap_err();
        assert!(matches!(err, StorageError::CounterOverflow { ref id } if id == "big"));

        let err = store
            .merge_batch(&[
                MetricRecord::counter("small", 1),
                MetricRecord::counter("big", 1),
            ])
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(store.get(MetricKind::Counter, "small").unwrap_err().is_not_found());

        // The column never degrades to REAL.
        assert_eq!(
            store.get(MetricKind::Counter, "big").unwrap(),
            MetricValue::Counter(i64::MAX)
        );
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn reset_and_take_snapshot() {
        let store = memory_store();
        store.merge(&MetricRecord::counter("PollCount", 4)).unwrap();
        store.merge(&MetricRecord::gauge("g", 2.0)).unwrap();

        let pack = store.take_snapshot().unwrap();
        assert!(pack.metrics.contains(&MetricRecord::counter("PollCount", 4)));
        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(0)
        );

        store.merge(&MetricRecord::counter("PollCount", 2)).unwrap();
        store.reset_counter("PollCount").unwrap();
        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(0)
        );
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.db");
        let dsn = path.to_string_lossy().to_string();
        {
            let store = SqliteStorage::open(&dsn, RetryPolicy::none()).unwrap();
            store.merge(&MetricRecord::counter("PollCount", 3)).unwrap();
        }
        let store = SqliteStorage::open(&dsn, RetryPolicy::none()).unwrap();
        assert_eq!(
            store.get(MetricKind::Counter, "PollCount").unwrap(),
            MetricValue::Counter(3)
        );
        assert!(store.ping().is_ok());
    }
}
