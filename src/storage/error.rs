use crate::model::MetricKind;

/// Errors raised by a [`MetricStore`](super::MetricStore).
///
/// `NotFound` is an expected outcome of a lookup and is kept apart from
/// backend failures so callers can answer "absent" instead of "broken".
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage: {kind} '{id}' not found")]
    NotFound { kind: MetricKind, id: String },

    /// The merge would push a counter outside the `i64` range. Nothing is written.
    #[error("Storage: counter '{id}' would overflow")]
    CounterOverflow { id: String },

    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("Storage: background task failed: {0}")]
    Task(String),

    #[error("Storage: {0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(kind: MetricKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn counter_overflow(id: impl Into<String>) -> Self {
        Self::CounterOverflow { id: id.into() }
    }

    /// The store refused the input itself; retrying cannot help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CounterOverflow { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
