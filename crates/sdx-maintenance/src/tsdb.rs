//! Time-series data hook.
//!
//! The maintenance queue knows nothing about how time series are laid out.
//! It asks a [`TimeSeriesDataStore`] whether a span holds time-series data
//! and delegates pruning to it.
//!
//! [`TimeSeriesStore`] is the bundled implementation. Samples live at
//! `/tsd/<series>/<slot>`, where `<slot>` is the sample's wall time in
//! nanoseconds, zero-padded so that byte order is time order.

use crate::client::KvClient;
use crate::error::PruneError;
use async_trait::async_trait;
use sdx_core::{Key, Timestamp};
use sdx_engine::{mvcc_put, MvccError, Reader, Snapshot, Writer};
use sdx_incremental::{IncrementalIterConfig, IncrementalIterator, IterError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Prefix of every time-series key.
pub const TSD_PREFIX: &[u8] = b"/tsd/";

const SLOT_WIDTH: usize = 20;

/// Capability the maintenance queue needs from the time-series system.
#[async_trait]
pub trait TimeSeriesDataStore: Send + Sync {
    /// Whether `[start, end)` may hold time-series data.
    fn contains_time_series(&self, start: &Key, end: &Key) -> bool;

    /// Delete time-series data in `[start, end)` that has aged out as of `now`.
    ///
    /// `snapshot` is used to discover what to delete; deletes go through
    /// `client` and must be idempotent, since other nodes may prune the same
    /// series concurrently.
    async fn prune_time_series(
        &self,
        cancel: &CancellationToken,
        snapshot: &dyn Snapshot,
        start: &Key,
        end: &Key,
        client: &dyn KvClient,
        now: Timestamp,
    ) -> Result<(), PruneError>;
}

/// Configuration for [`TimeSeriesStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    /// Samples older than this are pruned.
    pub retention: Duration,

    /// Cursor options for the discovery scan.
    #[serde(default)]
    pub iterator: IncrementalIterConfig,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        TimeSeriesConfig {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            iterator: IncrementalIterConfig::default(),
        }
    }
}

/// Key of the sample of `series` at `wall_time`.
pub fn series_key(series: &str, wall_time: i64) -> Key {
    let slot = format!("{:0width$}", wall_time.max(0), width = SLOT_WIDTH);
    series_prefix(series).join(slot.as_bytes())
}

/// Prefix of every sample of `series`.
pub fn series_prefix(series: &str) -> Key {
    Key::new(TSD_PREFIX.to_vec()).join(format!("{}/", series).as_bytes())
}

/// Split a sample key into its series name and slot.
pub fn parse_series_key(key: &Key) -> Option<(&str, i64)> {
    let rest = key.as_bytes().strip_prefix(TSD_PREFIX)?;
    let rest = std::str::from_utf8(rest).ok()?;
    let (series, slot) = rest.rsplit_once('/')?;
    if series.is_empty() || slot.len() != SLOT_WIDTH {
        return None;
    }
    Some((series, slot.parse().ok()?))
}

/// Record a sample. Mostly useful for seeding tests and demos.
pub fn write_sample<E: Reader + Writer + ?Sized>(
    engine: &E,
    series: &str,
    at: Timestamp,
    value: &[u8],
) -> Result<(), MvccError> {
    mvcc_put(engine, &series_key(series, at.wall_time), at, value, None)
}

/// Time-series system with a fixed retention period.
#[derive(Clone, Debug, Default)]
pub struct TimeSeriesStore {
    config: TimeSeriesConfig,
}

impl TimeSeriesStore {
    pub fn new(config: TimeSeriesConfig) -> Self {
        TimeSeriesStore { config }
    }

    pub fn config(&self) -> &TimeSeriesConfig {
        &self.config
    }

    /// The overlap of `[start, end)` with the time-series keyspace.
    fn clamp(start: &Key, end: &Key) -> Option<(Key, Key)> {
        let tsd_start = Key::new(TSD_PREFIX.to_vec());
        let tsd_end = tsd_start.prefix_end();
        let start = start.clone().max(tsd_start);
        let end = end.clone().min(tsd_end);
        (start < end).then_some((start, end))
    }

    /// Series in `[start, end)` whose newest sample older than `threshold` is live.
    fn find_prunable<R: Reader + ?Sized>(
        &self,
        cancel: &CancellationToken,
        reader: &R,
        start: &Key,
        end: &Key,
        threshold: i64,
        now: Timestamp,
    ) -> Result<BTreeSet<String>, IterError> {
        let mut iter =
            IncrementalIterator::with_config(reader, Timestamp::MIN, now, &self.config.iterator)?
                .with_cancellation(cancel.clone());
        iter.reset(start, end);

        let mut series = BTreeSet::new();
        let mut last: Option<Key> = None;
        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                // Only the newest version of each key decides.
                if last.as_ref() != Some(&key.key) {
                    if let Some((name, slot)) = parse_series_key(&key.key) {
                        if slot < threshold && !value.is_empty() {
                            series.insert(name.to_string());
                        }
                    }
                    last = Some(key.key.clone());
                }
            }
            iter.next();
        }
        match iter.error() {
            Some(err) => Err(err.clone()),
            None => Ok(series),
        }
    }
}

#[async_trait]
impl TimeSeriesDataStore for TimeSeriesStore {
    fn contains_time_series(&self, start: &Key, end: &Key) -> bool {
        Self::clamp(start, end).is_some()
    }

    async fn prune_time_series(
        &self,
        cancel: &CancellationToken,
        snapshot: &dyn Snapshot,
        start: &Key,
        end: &Key,
        client: &dyn KvClient,
        now: Timestamp,
    ) -> Result<(), PruneError> {
        let Some((start, end)) = Self::clamp(start, end) else {
            return Ok(());
        };
        let threshold = now.sub_duration(self.config.retention).wall_time;
        let series = self.find_prunable(cancel, snapshot, &start, &end, threshold, now)?;

        let mut deleted = 0;
        for name in &series {
            if cancel.is_cancelled() {
                return Err(PruneError::Cancelled);
            }
            let prefix = series_prefix(name);
            // Clamped so a series straddling the span is only pruned here.
            let lo = prefix.clone().max(start.clone());
            let hi = series_key(name, threshold).min(end.clone());
            if lo >= hi {
                continue;
            }
            let n = client.delete_range(&lo, &hi, now).await?;
            debug!(series = %name, deleted = n, "pruned series");
            deleted += n;
        }

        if !series.is_empty() {
            info!(%start, %end, series = series.len(), deleted, "pruned time series");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdx_core::TxnMeta;
    use sdx_engine::{mvcc_delete, MemEngine};

    #[test]
    fn test_series_key_layout() {
        let key = series_key("cpu.user", 42);
        assert_eq!(key, Key::from("/tsd/cpu.user/00000000000000000042"));
        assert_eq!(parse_series_key(&key), Some(("cpu.user", 42)));
        assert!(series_prefix("cpu.user").is_prefix_of(&key));

        // Slots sort numerically.
        assert!(series_key("m", 9) < series_key("m", 10));
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(parse_series_key(&Key::from("/db1")), None);
        assert_eq!(parse_series_key(&Key::from("/tsd/cpu")), None);
        assert_eq!(parse_series_key(&Key::from("/tsd//00000000000000000001")), None);
        assert_eq!(parse_series_key(&Key::from("/tsd/cpu/12")), None);
    }

    #[test]
    fn test_contains_time_series() {
        let ts = TimeSeriesStore::default();
        assert!(ts.contains_time_series(&Key::min(), &Key::max()));
        assert!(ts.contains_time_series(&Key::from("/tsd/a"), &Key::from("/tsd/b")));
        assert!(ts.contains_time_series(&Key::from("/a"), &Key::from("/tsd/\x01")));
        assert!(!ts.contains_time_series(&Key::from("/a"), &Key::from("/tsd/")));
        assert!(!ts.contains_time_series(&Key::from("/tsd0"), &Key::max()));
        assert!(!ts.contains_time_series(&Key::from("/db1"), &Key::from("/db2")));
    }

    #[test]
    fn test_find_prunable_reads_newest_version_per_key() {
        let engine = MemEngine::new();
        for (series, wall) in [("old", 1), ("old", 2), ("gone", 1), ("new", 50)] {
            write_sample(&engine, series, Timestamp::from_wall(wall), b"1").unwrap();
        }
        mvcc_delete(&engine, &series_key("gone", 1), Timestamp::from_wall(3), None).unwrap();
        let ts = TimeSeriesStore::default();
        let cancel = CancellationToken::new();
        let now = Timestamp::from_wall(100);
        let (start, end) = TimeSeriesStore::clamp(&Key::min(), &Key::max()).unwrap();

        let found = ts.find_prunable(&cancel, &engine, &start, &end, 10, now).unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["old".to_string()]);

        let key = series_key("new", 60);
        let txn = TxnMeta::new(key.clone(), Timestamp::from_wall(60));
        mvcc_put(&engine, &key, Timestamp::from_wall(60), b"2", Some(&txn)).unwrap();
        assert!(matches!(
            ts.find_prunable(&cancel, &engine, &start, &end, 10, now),
            Err(IterError::ConflictingIntents { .. })
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: TimeSeriesConfig =
            serde_json::from_str(r#"{"retention": {"secs": 60, "nanos": 0}}"#).unwrap();
        assert_eq!(config.retention, Duration::from_secs(60));
        assert!(config.iterator.time_bound_iterators);
    }
}
