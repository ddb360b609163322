//! Replicas and the store that hosts them.
//!
//! Queues see replicas and stores through the [`Replica`] and [`Store`]
//! traits. [`MemStore`] and [`MemReplica`] implement them over a
//! [`MemEngine`], keeping per-queue bookkeeping in range-local keys of the
//! same engine.

use crate::error::ReplicaError;
use parking_lot::RwLock;
use sdx_core::{Clock, Key, RangeDescriptor, RangeId, Timestamp};
use sdx_engine::{mvcc_get, mvcc_put, Engine, MemEngine};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A replica of one range, as seen by a queue.
pub trait Replica: Send + Sync {
    /// The span this replica holds.
    fn desc(&self) -> RangeDescriptor;

    /// Whether this replica holds a lease valid at `now`.
    fn owns_valid_lease(&self, now: Timestamp) -> bool;

    /// Whether the range is wider than the split policy allows.
    fn needs_split(&self) -> bool;

    /// When `queue` last finished with this replica. [`Timestamp::MIN`] if never.
    fn get_queue_last_processed(&self, queue: &str) -> Result<Timestamp, ReplicaError>;

    fn set_queue_last_processed(&self, queue: &str, ts: Timestamp) -> Result<(), ReplicaError>;
}

/// The node-local store hosting replicas.
pub trait Store: Send + Sync {
    fn engine(&self) -> &dyn Engine;

    fn clock(&self) -> &Clock;

    /// Replicas currently hosted, in range order.
    fn replicas(&self) -> Vec<Arc<dyn Replica>>;

    fn replica_count(&self) -> usize {
        self.replicas().len()
    }
}

/// Range-local key holding the last-processed timestamp of `queue`.
pub fn queue_last_processed_key(range_id: RangeId, queue: &str) -> Key {
    Key::from(format!("/local/range/{}/queue-last-processed/{}", range_id, queue).as_str())
}

/// A replica backed by a shared [`MemEngine`].
pub struct MemReplica {
    desc: RangeDescriptor,
    engine: Arc<MemEngine>,
    clock: Arc<Clock>,
    lease: AtomicBool,
    needs_split: AtomicBool,
}

impl MemReplica {
    /// A leaseholder replica for `desc`.
    pub fn new(desc: RangeDescriptor, engine: Arc<MemEngine>, clock: Arc<Clock>) -> Self {
        MemReplica {
            desc,
            engine,
            clock,
            lease: AtomicBool::new(true),
            needs_split: AtomicBool::new(false),
        }
    }

    pub fn range_id(&self) -> RangeId {
        self.desc.range_id
    }

    pub fn set_lease(&self, held: bool) {
        self.lease.store(held, Ordering::SeqCst);
    }

    pub fn set_needs_split(&self, needs_split: bool) {
        self.needs_split.store(needs_split, Ordering::SeqCst);
    }
}

impl Replica for MemReplica {
    fn desc(&self) -> RangeDescriptor {
        self.desc.clone()
    }

    fn owns_valid_lease(&self, _now: Timestamp) -> bool {
        self.lease.load(Ordering::SeqCst)
    }

    fn needs_split(&self) -> bool {
        self.needs_split.load(Ordering::SeqCst)
    }

    fn get_queue_last_processed(&self, queue: &str) -> Result<Timestamp, ReplicaError> {
        let key = queue_last_processed_key(self.range_id(), queue);
        let bytes = mvcc_get(self.engine.as_ref(), &key, Timestamp::MAX).map_err(|source| {
            ReplicaError::Mvcc {
                queue: queue.to_string(),
                source,
            }
        })?;
        match bytes {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| ReplicaError::Codec {
                queue: queue.to_string(),
                source,
            }),
            None => Ok(Timestamp::MIN),
        }
    }

    fn set_queue_last_processed(&self, queue: &str, ts: Timestamp) -> Result<(), ReplicaError> {
        let key = queue_last_processed_key(self.range_id(), queue);
        let bytes = serde_json::to_vec(&ts).map_err(|source| ReplicaError::Codec {
            queue: queue.to_string(),
            source,
        })?;
        mvcc_put(self.engine.as_ref(), &key, self.clock.now(), &bytes, None).map_err(|source| {
            ReplicaError::Mvcc {
                queue: queue.to_string(),
                source,
            }
        })
    }
}

/// A store over one [`MemEngine`].
pub struct MemStore {
    engine: Arc<MemEngine>,
    clock: Arc<Clock>,
    replicas: RwLock<BTreeMap<RangeId, Arc<MemReplica>>>,
}

impl MemStore {
    pub fn new(engine: Arc<MemEngine>, clock: Arc<Clock>) -> Self {
        MemStore {
            engine,
            clock,
            replicas: RwLock::new(BTreeMap::new()),
        }
    }

    /// Host a replica for `desc`, replacing any replica of the same range.
    pub fn add_replica(&self, desc: RangeDescriptor) -> Arc<MemReplica> {
        let range_id = desc.range_id;
        let replica = Arc::new(MemReplica::new(desc, self.engine.clone(), self.clock.clone()));
        self.replicas.write().insert(range_id, replica.clone());
        replica
    }

    pub fn remove_replica(&self, range_id: RangeId) -> Option<Arc<MemReplica>> {
        self.replicas.write().remove(&range_id)
    }

}

impl Store for MemStore {
    fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }

    fn replicas(&self) -> Vec<Arc<dyn Replica>> {
        self.replicas
            .read()
            .values()
            .map(|r| r.clone() as Arc<dyn Replica>)
            .collect()
    }

    fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdx_core::ManualSource;
    use sdx_engine::Writer;
    use sdx_core::MvccKey;
    use std::time::Duration;

    fn store() -> (MemStore, Arc<MemEngine>, Arc<ManualSource>) {
        let source = Arc::new(ManualSource::new(1_000));
        let clock = Arc::new(Clock::manual(source.clone()));
        let engine = Arc::new(MemEngine::new());
        (MemStore::new(engine.clone(), clock), engine, source)
    }

    #[test]
    fn test_last_processed_round_trips_through_engine() {
        let (store, _, source) = store();
        let repl = store.add_replica(RangeDescriptor::new(1, "/tsd/", "/tsd0"));
        assert_eq!(repl.get_queue_last_processed("q").unwrap(), Timestamp::MIN);

        let ts = Timestamp::new(500, 3);
        repl.set_queue_last_processed("q", ts).unwrap();
        assert_eq!(repl.get_queue_last_processed("q").unwrap(), ts);
        assert_eq!(repl.get_queue_last_processed("other").unwrap(), Timestamp::MIN);

        // A later write wins.
        source.advance(Duration::from_secs(1));
        repl.set_queue_last_processed("q", Timestamp::from_wall(900)).unwrap();
        assert_eq!(
            repl.get_queue_last_processed("q").unwrap(),
            Timestamp::from_wall(900)
        );
    }

    #[test]
    fn test_malformed_bookkeeping_is_an_error() {
        let (store, engine, _) = store();
        let repl = store.add_replica(RangeDescriptor::new(7, "a", "b"));
        let key = queue_last_processed_key(7, "q");
        engine
            .put(MvccKey::version(key, Timestamp::from_wall(1)), b"not json".to_vec())
            .unwrap();

        assert!(matches!(
            repl.get_queue_last_processed("q"),
            Err(ReplicaError::Codec { .. })
        ));
    }

    #[test]
    fn test_store_tracks_replicas() {
        let (store, _, _) = store();
        store.add_replica(RangeDescriptor::new(2, "m", "z"));
        store.add_replica(RangeDescriptor::new(1, "a", "m"));
        assert_eq!(store.replica_count(), 2);

        let ids: Vec<_> = store.replicas().iter().map(|r| r.desc().range_id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(store.remove_replica(1).is_some());
        assert!(store.remove_replica(1).is_none());
        let ids: Vec<_> = store.replicas().iter().map(|r| r.desc().range_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_lease_and_split_flags() {
        let (store, _, _) = store();
        let repl = store.add_replica(RangeDescriptor::new(1, "a", "b"));
        assert!(repl.owns_valid_lease(Timestamp::MIN));
        assert!(!repl.needs_split());

        repl.set_lease(false);
        repl.set_needs_split(true);
        assert!(!repl.owns_valid_lease(Timestamp::MIN));
        assert!(repl.needs_split());
    }
}
