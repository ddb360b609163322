//! The capability interface between a replica queue and the scheduler that
//! drives it.
//!
//! A queue is a strategy object: it decides *whether* and *how urgently* a
//! replica should be processed, does the processing, and paces itself. The
//! scheduler ([`QueueDriver`](crate::QueueDriver)) owns everything else:
//! lease checks, the bounded pending set, concurrency and metrics.

use crate::error::ProcessError;
use crate::replica::Replica;
use async_trait::async_trait;
use sdx_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cluster-wide configuration passed through to queue callbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Version of the gossiped configuration this value was built from.
    pub version: u64,
}

/// Counters the scheduler maintains on a queue's behalf.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    pending: AtomicU64,
    processing_nanos: AtomicU64,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub pending: u64,
    pub processing_nanos: u64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending as u64, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.processing_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn processing_nanos(&self) -> u64 {
        self.processing_nanos.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            successes: self.successes(),
            failures: self.failures(),
            pending: self.pending(),
            processing_nanos: self.processing_nanos(),
        }
    }
}

/// Static registration of a queue with the scheduler.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Name used for logging and last-processed bookkeeping.
    pub name: &'static str,

    /// Maximum number of replicas waiting to be processed.
    pub max_size: usize,

    /// Only process replicas holding a valid lease.
    pub needs_lease: bool,

    /// Accept replicas whose range still needs to be split.
    pub accepts_unsplit_ranges: bool,

    /// Counters updated by the scheduler.
    pub metrics: Arc<QueueMetrics>,
}

/// A replica queue, as plugged into the scheduler.
///
/// Callbacks may run concurrently for different replicas. The scheduler never
/// runs `should_queue` and `process` concurrently for the same replica.
#[async_trait]
pub trait ReplicaQueue: Send + Sync {
    fn config(&self) -> &QueueConfig;

    /// Whether `repl` should be queued, and with what priority. Higher
    /// priorities are processed first.
    fn should_queue(
        &self,
        cancel: &CancellationToken,
        now: Timestamp,
        repl: &dyn Replica,
        sys_config: &SystemConfig,
    ) -> (bool, f64);

    async fn process(
        &self,
        cancel: &CancellationToken,
        repl: &dyn Replica,
        sys_config: &SystemConfig,
    ) -> Result<(), ProcessError>;

    /// How long to wait before processing the next replica, given that the
    /// last one took `elapsed`.
    fn timer(&self, elapsed: Duration) -> Duration;

    /// Signal for retrying replicas parked after a failure. `None` means
    /// failures are only counted.
    fn purgatory_chan(&self) -> Option<watch::Receiver<()>> {
        None
    }
}
