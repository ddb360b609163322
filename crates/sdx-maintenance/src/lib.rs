//! # sdx-maintenance
//!
//! Periodic per-replica maintenance for the Sardonyx versioned store.
//!
//! This crate provides:
//! - [`ReplicaQueue`]: the capability interface a queue implements to be
//!   driven by a scheduler, with its [`QueueConfig`] and [`QueueMetrics`]
//! - [`TimeSeriesMaintenanceQueue`]: finds replicas holding time-series data
//!   that are due for maintenance and prunes aged-out samples through a
//!   [`TimeSeriesDataStore`]
//! - [`TimeSeriesStore`]: a time-series layout whose pruning scans an engine
//!   snapshot with an incremental iterator and issues idempotent deletes
//! - [`QueueDriver`]: a small scheduler with lease checks, a bounded priority
//!   set, paced processing and a concurrency cap
//! - In-memory [`MemStore`], [`MemReplica`] and [`LocalClient`]
//!
//! ## Example
//!
//! ```rust
//! use sdx_core::{Clock, ManualSource, RangeDescriptor, Timestamp};
//! use sdx_engine::MemEngine;
//! use sdx_maintenance::{
//!     write_sample, LocalClient, MaintenanceConfig, MemStore, QueueDriver,
//!     TimeSeriesMaintenanceQueue, TimeSeriesStore,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! const DAY: i64 = 24 * 3_600_000_000_000;
//! let engine = Arc::new(MemEngine::new());
//! let source = Arc::new(ManualSource::new(100 * DAY));
//! let store = Arc::new(MemStore::new(engine.clone(), Arc::new(Clock::manual(source))));
//! store.add_replica(RangeDescriptor::new(1, "/tsd/", "/tsd0"));
//! write_sample(engine.as_ref(), "cpu", Timestamp::from_wall(DAY), b"0.5").unwrap();
//!
//! let config = MaintenanceConfig::default();
//! let queue = Arc::new(TimeSeriesMaintenanceQueue::new(
//!     store.clone(),
//!     Arc::new(LocalClient::new(engine.clone())),
//!     Arc::new(TimeSeriesStore::new(config.time_series.clone())),
//!     &config,
//! ));
//! let driver = QueueDriver::new(queue.clone(), store.clone());
//!
//! let cancel = CancellationToken::new();
//! assert_eq!(driver.scan_once(&cancel), 1);
//! assert_eq!(driver.drain(&cancel).await, (1, 0));
//! assert_eq!(queue.metrics().successes(), 1);
//! # });
//! ```

mod client;
mod driver;
mod error;
mod framework;
mod queue;
mod replica;
mod tsdb;

pub use client::{KvClient, LocalClient};
pub use driver::QueueDriver;
pub use error::{ClientError, ProcessError, PruneError, ReplicaError};
pub use framework::{QueueConfig, QueueMetrics, QueueMetricsSnapshot, ReplicaQueue, SystemConfig};
pub use queue::{
    should_queue_again, MaintenanceConfig, MaintenanceConfigBuilder, TimeSeriesMaintenanceQueue,
    TIME_SERIES_MAINTENANCE_INTERVAL, TIME_SERIES_MAINTENANCE_QUEUE_MAX_SIZE,
    TIME_SERIES_MAINTENANCE_QUEUE_NAME,
};
pub use replica::{queue_last_processed_key, MemReplica, MemStore, Replica, Store};
pub use tsdb::{
    parse_series_key, series_key, series_prefix, write_sample, TimeSeriesConfig,
    TimeSeriesDataStore, TimeSeriesStore, TSD_PREFIX,
};
