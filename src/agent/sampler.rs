//! Metric sources for the agent.
//!
//! Each [`Sampler`] gathers one category of observations. [`run_sampler`]
//! drives a sampler on its poll interval and writes every record into the
//! agent's local store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::model::MetricRecord;
use crate::storage::MetricStore;

/// A source of metric observations polled on a fixed cadence.
pub trait Sampler: Send {
    /// Used in logs.
    fn name(&self) -> &str;

    /// Current observations. Gauges carry absolute values, counters carry
    /// the increment since the previous call.
    fn sample(&mut self) -> Result<Vec<MetricRecord>>;
}

// ─── Process ─────────────────────────────────────────────────────

/// Statistics of the agent process itself, plus the per-tick `PollCount`
/// counter and `RandomValue` gauge.
pub struct RuntimeSampler {
    system: System,
    pid: Pid,
}

impl RuntimeSampler {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("current pid: {e}"))?;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self { system, pid })
    }
}

impl Sampler for RuntimeSampler {
    fn name(&self) -> &str {
        "runtime"
    }

    fn sample(&mut self) -> Result<Vec<MetricRecord>> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} vanished", self.pid))?;
        let disk = process.disk_usage();

        Ok(vec![
            MetricRecord::gauge("ResidentMemory", process.memory() as f64),
            MetricRecord::gauge("VirtualMemory", process.virtual_memory() as f64),
            MetricRecord::gauge("ProcessCPU", process.cpu_usage() as f64),
            MetricRecord::gauge("RunTime", process.run_time() as f64),
            MetricRecord::gauge("DiskReadBytes", disk.total_read_bytes as f64),
            MetricRecord::gauge("DiskWrittenBytes", disk.total_written_bytes as f64),
            MetricRecord::gauge("RandomValue", rand::thread_rng().gen::<f64>()),
            MetricRecord::counter("PollCount", 1),
        ])
    }
}

// ─── Host ────────────────────────────────────────────────────────

/// Host memory and per-core CPU utilization.
pub struct HostSampler {
    system: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes.
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for HostSampler {
    fn name(&self) -> &str {
        "host"
    }

    fn sample(&mut self) -> Result<Vec<MetricRecord>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_all();

        let mut records = vec![
            MetricRecord::gauge("TotalMemory", self.system.total_memory() as f64),
            MetricRecord::gauge("FreeMemory", self.system.free_memory() as f64),
            MetricRecord::gauge("UsedMemory", self.system.used_memory() as f64),
            MetricRecord::gauge("AvailableMemory", self.system.available_memory() as f64),
        ];
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            records.push(MetricRecord::gauge(
                format!("CPUutilization{}", i + 1),
                cpu.cpu_usage() as f64,
            ));
        }
        Ok(records)
    }
}

// ─── Driver ──────────────────────────────────────────────────────

/// Write each record on its own. A failed write is logged and skipped;
/// the rest of the tick still lands. Returns how many were written.
pub fn write_all(store: &dyn MetricStore, source: &str, records: &[MetricRecord]) -> usize {
    let mut written = 0;
    for record in records {
        if !record.is_representable() {
            tracing::debug!(sampler = source, metric = %record.id, "skipping non-finite sample");
            continue;
        }
        match store.merge(record) {
            Ok(()) => written += 1,
            Err(e) => tracing::warn!(
                sampler = source,
                metric = %record.id,
                error = %e,
                "failed to store sample"
            ),
        }
    }
    written
}

/// Poll `sampler` every `every` until `token` is cancelled.
pub async fn run_sampler(
    mut sampler: Box<dyn Sampler>,
    store: Arc<dyn MetricStore>,
    every: Duration,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(sampler = sampler.name(), ?every, "sampler started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tick.tick() => {}
        }

        let records = match sampler.sample() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(sampler = sampler.name(), error = %e, "sampling failed");
                continue;
            }
        };
        let written = write_all(store.as_ref(), sampler.name(), &records);
        tracing::debug!(sampler = sampler.name(), written, total = records.len(), "sampled");
    }

    tracing::info!(sampler = sampler.name(), "sampler stopped");
}
