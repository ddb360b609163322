//! The time-series maintenance queue.
//!
//! Picks replicas that hold time-series data and have not been maintained in
//! the last [`TIME_SERIES_MAINTENANCE_INTERVAL`], then hands them to the
//! [`TimeSeriesDataStore`] for pruning. Deletes are issued cluster-wide and
//! are idempotent, so several nodes pruning the same series at once converge
//! on the same result.

use crate::client::KvClient;
use crate::error::ProcessError;
use crate::framework::{QueueConfig, QueueMetrics, ReplicaQueue, SystemConfig};
use crate::replica::{Replica, Store};
use crate::tsdb::{TimeSeriesConfig, TimeSeriesDataStore};
use async_trait::async_trait;
use sdx_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum interval between two maintenance runs on a replica.
pub const TIME_SERIES_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const TIME_SERIES_MAINTENANCE_QUEUE_MAX_SIZE: usize = 100;

pub const TIME_SERIES_MAINTENANCE_QUEUE_NAME: &str = "timeSeriesMaintenance";

/// Configuration for time-series maintenance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Queue replicas regardless of when they were last processed. Testing only.
    pub disable_last_processed_check: bool,

    /// Replicas processed at once by the driver.
    pub max_concurrency: usize,

    /// How often the driver rescans the store for candidates.
    pub scan_interval: Duration,

    /// Retention and scan options for the bundled time-series store.
    pub time_series: TimeSeriesConfig,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            disable_last_processed_check: false,
            max_concurrency: 4,
            scan_interval: Duration::from_secs(10 * 60),
            time_series: TimeSeriesConfig::default(),
        }
    }
}

/// Builder for [`MaintenanceConfig`].
pub struct MaintenanceConfigBuilder {
    config: MaintenanceConfig,
}

impl MaintenanceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MaintenanceConfig::default(),
        }
    }

    pub fn disable_last_processed_check(mut self, disabled: bool) -> Self {
        self.config.disable_last_processed_check = disabled;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.config.scan_interval = interval;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.time_series.retention = retention;
        self
    }

    pub fn time_bound_iterators(mut self, enabled: bool) -> Self {
        self.config.time_series.iterator.time_bound_iterators = enabled;
        self
    }

    pub fn build(self) -> MaintenanceConfig {
        self.config
    }
}

impl Default for MaintenanceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a replica last processed at `last` is due again at `now`, and how
/// overdue it is.
///
/// Never-processed replicas (and a zero interval) are due with priority 0.
/// Otherwise the priority is the number of intervals elapsed.
pub fn should_queue_again(now: Timestamp, last: Timestamp, interval: Duration) -> (bool, f64) {
    if interval.is_zero() || last.is_empty() {
        return (true, 0.0);
    }
    let elapsed = now.wall_since(last);
    if elapsed >= interval {
        return (true, elapsed.as_secs_f64() / interval.as_secs_f64());
    }
    (false, 0.0)
}

/// Replica queue pruning aged-out time-series data.
pub struct TimeSeriesMaintenanceQueue {
    config: QueueConfig,
    store: Arc<dyn Store>,
    client: Arc<dyn KvClient>,
    ts_data: Arc<dyn TimeSeriesDataStore>,
    disable_last_processed_check: bool,
}

impl TimeSeriesMaintenanceQueue {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn KvClient>,
        ts_data: Arc<dyn TimeSeriesDataStore>,
        config: &MaintenanceConfig,
    ) -> Self {
        TimeSeriesMaintenanceQueue {
            config: QueueConfig {
                name: TIME_SERIES_MAINTENANCE_QUEUE_NAME,
                max_size: TIME_SERIES_MAINTENANCE_QUEUE_MAX_SIZE,
                needs_lease: true,
                accepts_unsplit_ranges: true,
                metrics: Arc::new(QueueMetrics::new()),
            },
            store,
            client,
            ts_data,
            disable_last_processed_check: config.disable_last_processed_check,
        }
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.config.metrics
    }
}

#[async_trait]
impl ReplicaQueue for TimeSeriesMaintenanceQueue {
    fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn should_queue(
        &self,
        cancel: &CancellationToken,
        now: Timestamp,
        repl: &dyn Replica,
        _sys_config: &SystemConfig,
    ) -> (bool, f64) {
        if cancel.is_cancelled() {
            return (false, 0.0);
        }

        let mut priority = 0.0;
        if !self.disable_last_processed_check {
            let last = match repl.get_queue_last_processed(self.config.name) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(
                        range_id = repl.desc().range_id,
                        error = %e,
                        "time series maintenance queue last processed timestamp"
                    );
                    Timestamp::MIN
                }
            };
            let (due, p) = should_queue_again(now, last, TIME_SERIES_MAINTENANCE_INTERVAL);
            if !due {
                return (false, 0.0);
            }
            priority = p;
        }

        let desc = repl.desc();
        if self.ts_data.contains_time_series(&desc.start_key, &desc.end_key) {
            return (true, priority);
        }
        (false, 0.0)
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        repl: &dyn Replica,
        _sys_config: &SystemConfig,
    ) -> Result<(), ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let desc = repl.desc();
        let snapshot = self.store.engine().new_snapshot()?;
        let now = self.store.clock().now();
        let result = self
            .ts_data
            .prune_time_series(
                cancel,
                snapshot.as_ref(),
                &desc.start_key,
                &desc.end_key,
                self.client.as_ref(),
                now,
            )
            .await;
        drop(snapshot);
        result?;

        if let Err(e) = repl.set_queue_last_processed(self.config.name, now) {
            warn!(range_id = desc.range_id, error = %e, "failed to update last processed time");
        }
        debug!(range_id = desc.range_id, %now, "time series maintenance complete");
        Ok(())
    }

    fn timer(&self, elapsed: Duration) -> Duration {
        // Spread one run per replica evenly over the interval.
        let replica_count = self.store.replica_count();
        if replica_count == 0 {
            return Duration::ZERO;
        }
        let per_replica =
            TIME_SERIES_MAINTENANCE_INTERVAL / u32::try_from(replica_count).unwrap_or(u32::MAX);
        per_replica.saturating_sub(elapsed)
    }
}
