//! A small scheduler driving one [`ReplicaQueue`] over the replicas of a store.
//!
//! The driver:
//! 1. Periodically scans the store and offers each replica to the queue
//! 2. Keeps accepted replicas in a bounded set ordered by priority
//! 3. Processes them one at a time, sleeping [`ReplicaQueue::timer`] between
//!    replicas so a full pass is spread over the queue's interval
//! 4. Maintains the queue's metrics
//!
//! [`QueueDriver::drain`] processes everything pending at once, bounded by a
//! concurrency cap, for callers that don't want pacing.

use crate::error::ProcessError;
use crate::framework::{QueueConfig, ReplicaQueue, SystemConfig};
use crate::replica::{Replica, Store};
use parking_lot::Mutex;
use sdx_core::{RangeId, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Pending {
    priority: f64,
    seq: u64,
    replica: Arc<dyn Replica>,
}

impl Pending {
    /// Higher priority first, then first come first served.
    fn outranks(&self, other: &Pending) -> bool {
        match self.priority.total_cmp(&other.priority) {
            std::cmp::Ordering::Equal => self.seq < other.seq,
            ord => ord.is_gt(),
        }
    }
}

/// Queued replicas plus the ones currently being processed.
#[derive(Default)]
struct PendingSet {
    entries: Vec<Pending>,
    processing: HashSet<RangeId>,
    next_seq: u64,
}

impl PendingSet {
    fn contains(&self, range_id: RangeId) -> bool {
        self.processing.contains(&range_id)
            || self.entries.iter().any(|p| p.replica.desc().range_id == range_id)
    }

    /// Insert, evicting the lowest-ranked entry beyond `max_size`. Returns
    /// whether `replica` is still queued afterwards.
    fn push(&mut self, replica: Arc<dyn Replica>, priority: f64, max_size: usize) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Pending { priority, seq, replica });

        if self.entries.len() > max_size {
            let lowest = (0..self.entries.len())
                .reduce(|a, b| if self.entries[a].outranks(&self.entries[b]) { b } else { a });
            if let Some(i) = lowest {
                let evicted = self.entries.swap_remove(i);
                return evicted.seq != seq;
            }
        }
        true
    }

    /// Take the best entry and mark it as processing.
    fn pop(&mut self) -> Option<Arc<dyn Replica>> {
        let best = (0..self.entries.len())
            .reduce(|a, b| if self.entries[a].outranks(&self.entries[b]) { a } else { b })?;
        let replica = self.entries.swap_remove(best).replica;
        self.processing.insert(replica.desc().range_id);
        Some(replica)
    }
}

/// Marks a popped replica as in flight until dropped.
struct InFlight {
    pending: Arc<Mutex<PendingSet>>,
    range_id: RangeId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pending.lock().processing.remove(&self.range_id);
    }
}

/// Why `repl` may not be handed to the queue right now, if anything.
fn ineligible(config: &QueueConfig, repl: &dyn Replica, now: Timestamp) -> Option<&'static str> {
    if config.needs_lease && !repl.owns_valid_lease(now) {
        return Some("no valid lease");
    }
    if !config.accepts_unsplit_ranges && repl.needs_split() {
        return Some("range needs split");
    }
    None
}

/// Drives a [`ReplicaQueue`] over a [`Store`].
pub struct QueueDriver {
    queue: Arc<dyn ReplicaQueue>,
    store: Arc<dyn Store>,
    sys_config: SystemConfig,
    pending: Arc<Mutex<PendingSet>>,
    semaphore: Arc<Semaphore>,
    scan_interval: Duration,
}

impl QueueDriver {
    pub fn new(queue: Arc<dyn ReplicaQueue>, store: Arc<dyn Store>) -> Self {
        QueueDriver {
            queue,
            store,
            sys_config: SystemConfig::default(),
            pending: Arc::new(Mutex::new(PendingSet::default())),
            semaphore: Arc::new(Semaphore::new(1)),
            scan_interval: Duration::from_secs(10 * 60),
        }
    }

    /// Cap the number of replicas processed at once by [`drain`](Self::drain).
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        self
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Replicas waiting to be processed.
    pub fn len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `repl` to the queue. Returns whether it was queued.
    ///
    /// Replicas already queued or being processed are not offered again.
    pub fn maybe_add(
        &self,
        cancel: &CancellationToken,
        repl: Arc<dyn Replica>,
        now: Timestamp,
    ) -> bool {
        let config = self.queue.config();
        let range_id = repl.desc().range_id;

        if let Some(reason) = ineligible(config, repl.as_ref(), now) {
            debug!(queue = config.name, range_id, reason, "not queued");
            return false;
        }
        if self.pending.lock().contains(range_id) {
            return false;
        }

        let (should, priority) =
            self.queue.should_queue(cancel, now, repl.as_ref(), &self.sys_config);
        if !should {
            return false;
        }

        let mut pending = self.pending.lock();
        // Raced with another add of the same replica.
        if pending.contains(range_id) {
            return false;
        }
        let queued = pending.push(repl, priority, config.max_size);
        config.metrics.set_pending(pending.entries.len());
        if queued {
            debug!(queue = config.name, range_id, priority, "queued replica");
        }
        queued
    }

    /// Offer every replica of the store. Returns how many were queued.
    pub fn scan_once(&self, cancel: &CancellationToken) -> usize {
        let now = self.store.clock().now();
        let added = self
            .store
            .replicas()
            .into_iter()
            .filter(|repl| self.maybe_add(cancel, repl.clone(), now))
            .count();
        debug!(queue = self.queue.config().name, added, pending = self.len(), "scanned store");
        added
    }

    fn pop(&self) -> Option<(Arc<dyn Replica>, InFlight)> {
        let mut pending = self.pending.lock();
        let next = pending.pop();
        self.queue.config().metrics.set_pending(pending.entries.len());
        next.map(|repl| {
            let in_flight = InFlight {
                pending: self.pending.clone(),
                range_id: repl.desc().range_id,
            };
            (repl, in_flight)
        })
    }

    /// Process the highest-priority pending replica that is still eligible.
    ///
    /// Replicas that lost their lease (or now need a split) while queued are
    /// dropped without being processed. Returns `None` once nothing is left.
    pub async fn process_one(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<(), ProcessError>> {
        while let Some((repl, _in_flight)) = self.pop() {
            let processed = process_replica(
                self.queue.as_ref(),
                self.store.as_ref(),
                &self.sys_config,
                cancel,
                repl.as_ref(),
            )
            .await;
            if processed.is_some() {
                return processed;
            }
        }
        None
    }

    /// Process every pending replica, at most `max_concurrency` at a time.
    ///
    /// Returns `(successes, failures)`. Skipped replicas count as neither.
    pub async fn drain(&self, cancel: &CancellationToken) -> (usize, usize) {
        let mut tasks = JoinSet::new();
        while let Some((repl, in_flight)) = self.pop() {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let sys_config = self.sys_config.clone();
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _in_flight = in_flight;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Some(Err(ProcessError::Cancelled));
                };
                process_replica(queue.as_ref(), store.as_ref(), &sys_config, &cancel, repl.as_ref())
                    .await
            });
        }

        let (mut ok, mut failed) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(Ok(()))) => ok += 1,
                Ok(Some(Err(_))) => failed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = self.queue.config().name, error = %e, "processing task panicked");
                    failed += 1;
                }
            }
        }
        (ok, failed)
    }

    /// Scan and process until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let name = self.queue.config().name;
        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            queue = name,
            scan_interval_secs = self.scan_interval.as_secs(),
            "queue driver started"
        );

        'outer: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_once(&cancel);
                }
            }

            while let Some((repl, in_flight)) = self.pop() {
                let started = Instant::now();
                let processed = process_replica(
                    self.queue.as_ref(),
                    self.store.as_ref(),
                    &self.sys_config,
                    &cancel,
                    repl.as_ref(),
                )
                .await;
                drop(in_flight);
                if processed.is_none() {
                    continue;
                }
                let delay = self.queue.timer(started.elapsed());

                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    _ = sleep(delay) => {}
                }
            }
        }

        info!(queue = name, "queue driver shutting down");
    }
}

/// Process `repl` unless it became ineligible while queued, in which case it
/// is skipped and `None` is returned.
async fn process_replica(
    queue: &dyn ReplicaQueue,
    store: &dyn Store,
    sys_config: &SystemConfig,
    cancel: &CancellationToken,
    repl: &dyn Replica,
) -> Option<Result<(), ProcessError>> {
    let config = queue.config();
    let range_id = repl.desc().range_id;
    if let Some(reason) = ineligible(config, repl, store.clock().now()) {
        debug!(queue = config.name, range_id, reason, "skipped replica");
        return None;
    }

    let started = Instant::now();
    let result = queue.process(cancel, repl, sys_config).await;
    let elapsed = started.elapsed();
    config.metrics.record_processing_time(elapsed);

    match &result {
        Ok(()) => {
            config.metrics.record_success();
            debug!(
                queue = config.name,
                range_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "processed replica"
            );
        }
        Err(e) => {
            config.metrics.record_failure();
            warn!(
                queue = config.name,
                range_id,
                error = %e,
                retryable = e.is_retryable(),
                "failed to process replica"
            );
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicaError;
    use sdx_core::RangeDescriptor;

    struct Fake(RangeId);

    impl Replica for Fake {
        fn desc(&self) -> RangeDescriptor {
            RangeDescriptor::new(self.0, "a", "b")
        }
        fn owns_valid_lease(&self, _now: Timestamp) -> bool {
            true
        }
        fn needs_split(&self) -> bool {
            false
        }
        fn get_queue_last_processed(&self, _queue: &str) -> Result<Timestamp, ReplicaError> {
            Ok(Timestamp::MIN)
        }
        fn set_queue_last_processed(
            &self,
            _queue: &str,
            _ts: Timestamp,
        ) -> Result<(), ReplicaError> {
            Ok(())
        }
    }

    fn ids(set: &mut PendingSet) -> Vec<RangeId> {
        std::iter::from_fn(|| set.pop()).map(|r| r.desc().range_id).collect()
    }

    #[test]
    fn test_pending_orders_by_priority_then_arrival() {
        let mut set = PendingSet::default();
        set.push(Arc::new(Fake(1)), 0.5, 10);
        set.push(Arc::new(Fake(2)), 2.0, 10);
        set.push(Arc::new(Fake(3)), 0.5, 10);
        set.push(Arc::new(Fake(4)), 1.0, 10);
        assert_eq!(ids(&mut set), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_popped_entries_stay_known_until_released() {
        let pending = Arc::new(Mutex::new(PendingSet::default()));
        pending.lock().push(Arc::new(Fake(1)), 1.0, 10);

        let repl = pending.lock().pop().unwrap();
        assert!(pending.lock().entries.is_empty());
        assert!(pending.lock().contains(1));

        let in_flight = InFlight {
            pending: pending.clone(),
            range_id: repl.desc().range_id,
        };
        drop(in_flight);
        assert!(!pending.lock().contains(1));
    }

    #[test]
    fn test_pending_evicts_lowest() {
        let mut set = PendingSet::default();
        assert!(set.push(Arc::new(Fake(1)), 1.0, 2));
        assert!(set.push(Arc::new(Fake(2)), 3.0, 2));
        // Full: a newcomer ranked last is turned away.
        assert!(!set.push(Arc::new(Fake(3)), 0.5, 2));
        assert!(set.push(Arc::new(Fake(4)), 2.0, 2));
        assert_eq!(ids(&mut set), vec![2, 4]);
    }
}
