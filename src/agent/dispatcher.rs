//! Report pipeline: one producer snapshots the local store on the report
//! interval and feeds a bounded queue; a fixed pool of sender workers
//! drains it through a [`Transport`].
//!
//! The queue bound is the backpressure: when all workers are busy and the
//! queue is full, the producer waits. On cancellation the producer finishes
//! at most the send it is parked on, re-credits the rest of the tick and
//! drops its sender. Workers finish everything queued before exiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::stats::DeliveryStats;
use super::transport::Transport;
use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};
use crate::storage::MetricStore;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sender pool size.
    pub workers: usize,
    /// Queue bound, in payloads.
    pub capacity: usize,
    pub report_every: Duration,
    /// Send one `/updates/` pack per tick instead of one request per metric.
    pub batch: bool,
}

/// One unit of work on the queue.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(MetricRecord),
    Batch(MetricsPack),
}

impl Payload {
    pub fn records(&self) -> &[MetricRecord] {
        match self {
            Self::Single(record) => std::slice::from_ref(record),
            Self::Batch(pack) => &pack.metrics,
        }
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn MetricStore>,
    transport: Arc<dyn Transport>,
    stats: Arc<DeliveryStats>,
}

/// Running pipeline. Dropping it detaches the tasks; call [`join`](Self::join).
pub struct DispatcherHandle {
    producer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    queue: flume::Receiver<Payload>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn MetricStore>,
        transport: Arc<dyn Transport>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            stats,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> DispatcherHandle {
        let workers = self.config.workers.max(1);
        let (tx, rx) = flume::bounded(self.config.capacity.max(1));
        tracing::info!(
            workers,
            capacity = self.config.capacity.max(1),
            every = ?self.config.report_every,
            batch = self.config.batch,
            "dispatcher started"
        );

        let producer = tokio::spawn(produce(
            tx,
            self.store.clone(),
            self.stats.clone(),
            self.config.report_every,
            self.config.batch,
            token.clone(),
        ));

        let workers = (0..workers)
            .map(|id| {
                tokio::spawn(send_loop(
                    id,
                    rx.clone(),
                    self.transport.clone(),
                    self.store.clone(),
                    self.stats.clone(),
                    token.clone(),
                ))
            })
            .collect();

        DispatcherHandle {
            producer,
            workers,
            queue: rx,
        }
    }
}

impl DispatcherHandle {
    /// Payloads currently waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Wait for the producer and every worker to finish. Only returns after
    /// the token is cancelled and the queue is drained.
    pub async fn join(self) {
        drop(self.queue);
        if let Err(e) = self.producer.await {
            tracing::error!(error = %e, "producer task failed");
        }
        for (id, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                tracing::error!(worker = id, error = %e, "sender task failed");
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

// ─── Producer ────────────────────────────────────────────────────

fn payloads(pack: MetricsPack, batch: bool) -> Vec<Payload> {
    // Zero deltas carry nothing.
    let records: Vec<MetricRecord> = pack
        .metrics
        .into_iter()
        .filter(|r| r.value != MetricValue::Counter(0))
        .collect();
    if records.is_empty() {
        return Vec::new();
    }
    if batch {
        vec![Payload::Batch(MetricsPack::new(records))]
    } else {
        records.into_iter().map(Payload::Single).collect()
    }
}

async fn produce(
    tx: flume::Sender<Payload>,
    store: Arc<dyn MetricStore>,
    stats: Arc<DeliveryStats>,
    every: Duration,
    batch: bool,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'ticks: loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tick.tick() => {}
        }

        let pack = match store.take_snapshot() {
            Ok(pack) => pack,
            Err(e) => {
                tracing::error!(error = %e, "failed to snapshot local store");
                continue;
            }
        };

        // A pending send is never raced against the token: a dropped
        // flume send may still have landed in the queue.
        let mut closed = false;
        for payload in payloads(pack, batch) {
            if closed || token.is_cancelled() {
                recredit(store.as_ref(), &stats, &payload);
                continue;
            }
            match tx.send_async(payload).await {
                Ok(()) => stats.enqueued(),
                Err(flume::SendError(lost)) => {
                    tracing::error!("all senders gone, stopping producer");
                    closed = true;
                    recredit(store.as_ref(), &stats, &lost);
                }
            }
        }
        if closed {
            break 'ticks;
        }
    }

    tracing::debug!(queued = tx.len(), "producer stopped");
}

// ─── Senders ─────────────────────────────────────────────────────

async fn send_loop(
    id: usize,
    rx: flume::Receiver<Payload>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn MetricStore>,
    stats: Arc<DeliveryStats>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv_async() => match msg {
                Ok(payload) => deliver(id, transport.as_ref(), store.as_ref(), &stats, payload).await,
                Err(_) => return,
            },
        }
    }

    tracing::debug!(worker = id, pending = rx.len(), "draining queue");
    // Ends once the producer has dropped its sender and the queue is empty.
    while let Ok(payload) = rx.recv_async().await {
        deliver(id, transport.as_ref(), store.as_ref(), &stats, payload).await;
    }
    tracing::debug!(worker = id, "sender stopped");
}

async fn deliver(
    worker: usize,
    transport: &dyn Transport,
    store: &dyn MetricStore,
    stats: &DeliveryStats,
    payload: Payload,
) {
    stats.attempted();
    let started = Instant::now();
    let result = match &payload {
        Payload::Single(record) => transport.deliver(record).await,
        Payload::Batch(pack) => transport.deliver_batch(pack).await,
    };

    match result {
        Ok(()) => stats.delivered(started.elapsed()),
        Err(e) => {
            stats.failed();
            tracing::warn!(
                worker,
                records = payload.records().len(),
                error = %e,
                "delivery failed"
            );
            recredit(store, stats, &payload);
        }
    }
}

/// Put undelivered counter deltas back so the next report carries them.
/// Gauges are not restored; a newer sample supersedes them anyway.
fn recredit(store: &dyn MetricStore, stats: &DeliveryStats, payload: &Payload) {
    let counters: Vec<MetricRecord> = payload
        .records()
        .iter()
        .filter(|r| r.kind() == MetricKind::Counter)
        .cloned()
        .collect();
    if counters.is_empty() {
        return;
    }
    match store.merge_batch(&counters) {
        Ok(()) => stats.recredited(counters.len() as u64),
        Err(e) => tracing::error!(
            records = counters.len(),
            error = %e,
            "failed to re-credit counters, deltas lost"
        ),
    }
}
