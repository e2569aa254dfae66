use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::retry::RetryPolicy;
use crate::storage::PersistenceMode;

// ─── Agent ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Parser)]
#[command(name = "metrics-agent", about = "Samples runtime metrics and pushes them to a collector")]
pub struct AgentConfig {
    /// Collector address (host:port or full URL).
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between deliveries.
    #[arg(short = 'r', long, env = "REPORT_INTERVAL", default_value_t = 10)]
    pub report_interval: u64,

    /// Seconds between samples.
    #[arg(short = 'p', long, env = "POLL_INTERVAL", default_value_t = 2)]
    pub poll_interval: u64,

    /// Number of concurrent sender workers.
    #[arg(short = 'l', long = "rate-limit", env = "RATE_LIMIT", default_value_t = 2)]
    pub workers: usize,

    /// Bounded queue size between the snapshot producer and the senders.
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 64)]
    pub queue_capacity: usize,

    /// Shared HMAC key; when set every request carries a `HashSHA256` header.
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// Deliver one `{metrics:[...]}` document per tick instead of one request per metric.
    #[arg(long, env = "BATCH", default_value_t = false, action = ArgAction::Set)]
    pub batch: bool,

    #[command(flatten)]
    pub retry: RetryArgs,
}

impl AgentConfig {
    pub fn poll_every(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn report_every(&self) -> Duration {
        Duration::from_secs(self.report_interval.max(1))
    }

    /// Base URL of the collector, with a scheme.
    pub fn endpoint(&self) -> String {
        let addr = self.address.trim().trim_end_matches('/');
        if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        }
    }
}

// ─── Retry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, clap::Args)]
pub struct RetryArgs {
    /// Retries after the first failed attempt.
    #[arg(long, env = "RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Multiplier applied to the delay after each retry.
    #[arg(long, env = "RETRY_FACTOR", default_value_t = 2.0)]
    pub retry_factor: f64,

    /// Randomize each delay by ±50%.
    #[arg(long, env = "RETRY_JITTER", default_value_t = false, action = ArgAction::Set)]
    pub retry_jitter: bool,
}

impl RetryArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::with_backoff(
            self.retries,
            Duration::from_millis(self.retry_delay_ms),
            self.retry_factor,
        )
        .with_jitter(self.retry_jitter)
    }
}

// ─── Server ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Parser)]
#[command(name = "metrics-server", about = "Collects pushed metrics into a keyed store")]
pub struct ServerConfig {
    /// Listen address.
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between backup exports; 0 exports after every write.
    #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value_t = 300)]
    pub store_interval: u64,

    /// Backup file path.
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH", default_value = "backup.json")]
    pub file_storage_path: PathBuf,

    /// Load the backup file at startup.
    #[arg(short = 'r', long, env = "RESTORE", default_value_t = true, action = ArgAction::Set)]
    pub restore: bool,

    /// Relational database path. Enables the relational backend.
    #[arg(short = 'd', long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// Shared HMAC key used to check `HashSHA256` headers and sign responses.
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// Reject requests whose signature does not match instead of logging them.
    #[arg(long, env = "STRICT_SIGNATURE", default_value_t = false, action = ArgAction::Set)]
    pub strict_signature: bool,

    /// Upper bound, in seconds, for the HTTP drain and for the final export.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    #[command(flatten)]
    pub retry: RetryArgs,
}

/// What the storage layer needs to open a backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_dsn: Option<String>,
    pub retry: RetryPolicy,
}

impl ServerConfig {
    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            database_dsn: self.dsn().map(str::to_string),
            retry: self.retry.policy(),
        }
    }

    /// A relational backend is durable by itself; otherwise the export
    /// interval picks between synchronous and periodic backups.
    pub fn persistence(&self) -> PersistenceMode {
        if self.dsn().is_some() {
            PersistenceMode::Delegated
        } else if self.store_interval == 0 {
            PersistenceMode::Sync
        } else {
            PersistenceMode::Periodic(Duration::from_secs(self.store_interval))
        }
    }

    /// Restoring from the backup file only makes sense for the in-memory backend.
    pub fn restore_from_file(&self) -> bool {
        self.restore && self.dsn().is_none()
    }

    pub fn shutdown_limit(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn signing_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }

    fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|d| !d.trim().is_empty())
    }
}
