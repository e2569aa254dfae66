use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

// ─── Configuration ───────────────────────────────────────────────

/// HdrHistogram range: 1 μs → 60 s, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Delivery latency quantiles in microseconds. All zero before the first
/// successful delivery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PercentileSet {
    pub count: u64,
    pub min: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}

impl From<&Histogram<u64>> for PercentileSet {
    fn from(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        let q = |p: f64| hist.value_at_quantile(p);
        Self {
            count: hist.len(),
            min: hist.min(),
            p50: q(0.50),
            p95: q(0.95),
            p99: q(0.99),
            max: hist.max(),
            mean: hist.mean(),
        }
    }
}

/// Counters for one agent run, logged at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySummary {
    /// Payloads put on the queue by the producer.
    pub enqueued: u64,
    /// Payloads handed to a send attempt (successful or not).
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Counter records merged back into the local store after a failed send.
    pub recredited: u64,
    pub latency_us: PercentileSet,
}

/// Thread-safe delivery bookkeeping shared by producer and senders.
pub struct DeliveryStats {
    inner: Mutex<Inner>,
}

struct Inner {
    latency: Histogram<u64>,
    enqueued: u64,
    attempted: u64,
    delivered: u64,
    failed: u64,
    recredited: u64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                latency: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                    .expect("histogram creation"),
                enqueued: 0,
                attempted: 0,
                delivered: 0,
                failed: 0,
                recredited: 0,
            }),
        }
    }

    pub fn enqueued(&self) {
        self.inner.lock().enqueued += 1;
    }

    pub fn attempted(&self) {
        self.inner.lock().attempted += 1;
    }

    pub fn delivered(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.delivered += 1;
        // Clamp to ≥ 1 μs
        let us = (elapsed.as_micros() as u64).clamp(HIST_LOW, HIST_HIGH);
        let _ = inner.latency.record(us);
    }

    pub fn failed(&self) {
        self.inner.lock().failed += 1;
    }

    pub fn recredited(&self, records: u64) {
        self.inner.lock().recredited += records;
    }

    pub fn summary(&self) -> DeliverySummary {
        let inner = self.inner.lock();
        DeliverySummary {
            enqueued: inner.enqueued,
            attempted: inner.attempted,
            delivered: inner.delivered,
            failed: inner.failed,
            recredited: inner.recredited,
            latency_us: PercentileSet::from(&inner.latency),
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}
