//! The reporting agent: samplers write into a private in-memory store, the
//! dispatcher ships snapshots of it to the collector.

pub mod dispatcher;
pub mod sampler;
pub mod stats;
pub mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::storage::{MemStorage, MetricStore};
use dispatcher::{Dispatcher, DispatcherConfig};
use sampler::{HostSampler, RuntimeSampler, Sampler};
use stats::{DeliveryStats, DeliverySummary};
use transport::{HttpTransport, Transport};

/// Run the agent against an HTTP collector until `token` is cancelled.
pub async fn run(config: AgentConfig, token: CancellationToken) -> Result<DeliverySummary> {
    let transport = HttpTransport::new(config.endpoint(), config.key.clone(), config.retry.policy())
        .context("building HTTP client")?;
    let samplers: Vec<Box<dyn Sampler>> = vec![
        Box::new(RuntimeSampler::new().context("process sampler")?),
        Box::new(HostSampler::new()),
    ];
    run_with(&config, samplers, Arc::new(transport), token).await
}

/// Wire samplers and the dispatcher around a fresh local store, then wait
/// for cancellation and for every task to wind down.
pub async fn run_with(
    config: &AgentConfig,
    samplers: Vec<Box<dyn Sampler>>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
) -> Result<DeliverySummary> {
    let store: Arc<dyn MetricStore> = Arc::new(MemStorage::new());
    let stats = Arc::new(DeliveryStats::new());

    tracing::info!(
        endpoint = %config.endpoint(),
        poll = ?config.poll_every(),
        report = ?config.report_every(),
        workers = config.workers,
        signed = config.key.as_deref().is_some_and(|k| !k.is_empty()),
        "agent starting"
    );

    let sampler_tasks: Vec<_> = samplers
        .into_iter()
        .map(|s| {
            tokio::spawn(sampler::run_sampler(
                s,
                store.clone(),
                config.poll_every(),
                token.clone(),
            ))
        })
        .collect();

    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            workers: config.workers,
            capacity: config.queue_capacity,
            report_every: config.report_every(),
            batch: config.batch,
        },
        store,
        transport,
        stats.clone(),
    )
    .spawn(token.clone());

    token.cancelled().await;
    tracing::info!("shutdown requested, draining");

    for task in sampler_tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "sampler task failed");
        }
    }
    dispatcher.join().await;

    let summary = stats.summary();
    tracing::info!(
        enqueued = summary.enqueued,
        delivered = summary.delivered,
        failed = summary.failed,
        recredited = summary.recredited,
        p50_us = summary.latency_us.p50,
        p99_us = summary.latency_us.p99,
        "agent stopped"
    );
    Ok(summary)
}
