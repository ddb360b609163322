//! Segmented in-memory engine.
//!
//! Writes land in a memtable; [`MemEngine::flush`] freezes it into an
//! immutable segment. Each segment records the minimum and maximum version
//! timestamps it holds (and the oldest intent it holds), which lets
//! time-bounded cursors skip segments without reading them.
//!
//! A removed entry is recorded as a deletion marker in the newest layer so
//! that older segments stay immutable. Readers merge all layers, newest
//! wins.
//!
//! Snapshots share the frozen segments and the memtable by reference; the
//! memtable is copied only when written while a snapshot still holds it.

use crate::engine::{Engine, EngineIterator, IterOptions, Reader, Snapshot, TimeBounds, Writer};
use crate::error::EngineError;
use parking_lot::RwLock;
use sdx_core::{MvccKey, MvccMetadata, Timestamp};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Timestamp metadata for one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentBounds {
    /// Oldest version timestamp (including deletion markers of versions).
    pub min: Option<Timestamp>,

    /// Newest version timestamp.
    pub max: Option<Timestamp>,

    /// Oldest intent recorded in this segment's metadata entries.
    pub min_intent: Option<Timestamp>,
}

impl SegmentBounds {
    /// Widen the bounds to cover an entry.
    fn observe(&mut self, key: &MvccKey, value: Option<&[u8]>) {
        if key.is_value() {
            let ts = key.timestamp;
            self.min = Some(self.min.map_or(ts, |m| m.min(ts)));
            self.max = Some(self.max.map_or(ts, |m| m.max(ts)));
            return;
        }

        // Metadata entry. A deletion marker carries no timestamp; the full
        // view used for intent checks makes it irrelevant here.
        let Some(bytes) = value else { return };
        let intent_ts = match MvccMetadata::decode(bytes) {
            Ok(meta) if meta.is_intent() => meta.timestamp,
            Ok(_) => return,
            // Undecodable metadata can't be proven harmless.
            Err(_) => Timestamp::MIN,
        };
        self.min_intent = Some(self.min_intent.map_or(intent_ts, |m| m.min(intent_ts)));
    }

    /// Whether a cursor bounded by `tb` must read this segment.
    pub fn may_contain(&self, tb: &TimeBounds) -> bool {
        let versions = match (self.min, self.max) {
            (Some(min), Some(max)) => max > tb.start && min <= tb.end,
            _ => false,
        };
        let intents = self.min_intent.map_or(false, |t| t <= tb.end);
        versions || intents
    }
}

/// One layer of the engine: the memtable or a flushed segment.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    id: u64,
    entries: BTreeMap<MvccKey, Option<Vec<u8>>>,
    bounds: SegmentBounds,
}

impl Segment {
    fn new(id: u64) -> Self {
        Segment {
            id,
            entries: BTreeMap::new(),
            bounds: SegmentBounds::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bounds(&self) -> &SegmentBounds {
        &self.bounds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write(&mut self, key: MvccKey, value: Option<Vec<u8>>) {
        self.bounds.observe(&key, value.as_deref());
        self.entries.insert(key, value);
    }
}

/// An ordered stack of layers, oldest first.
#[derive(Clone, Debug, Default)]
struct LayeredView {
    layers: Vec<Arc<Segment>>,
}

impl LayeredView {
    fn get(&self, key: &MvccKey) -> Option<Vec<u8>> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.entries.get(key) {
                return entry.clone();
            }
        }
        None
    }

    fn iterator(&self, opts: IterOptions) -> MemIterator {
        let layers = match opts.time_bounds {
            Some(tb) => self
                .layers
                .iter()
                .filter(|l| !l.is_empty() && l.bounds.may_contain(&tb))
                .cloned()
                .collect(),
            None => self.layers.iter().filter(|l| !l.is_empty()).cloned().collect(),
        };
        MemIterator {
            layers,
            current: None,
        }
    }
}

/// Cursor merging several layers.
pub struct MemIterator {
    layers: Vec<Arc<Segment>>,
    current: Option<(MvccKey, Vec<u8>)>,
}

impl MemIterator {
    /// Number of layers this cursor reads. Segments skipped by time bounds
    /// are not counted.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn position(&mut self, mut from: Bound<MvccKey>) {
        loop {
            let candidate = self
                .layers
                .iter()
                .filter_map(|l| {
                    l.entries
                        .range::<MvccKey, _>((from.clone(), Bound::Unbounded))
                        .next()
                        .map(|(k, _)| k)
                })
                .min()
                .cloned();

            let Some(key) = candidate else {
                self.current = None;
                return;
            };

            let newest = self
                .layers
                .iter()
                .rev()
                .find_map(|l| l.entries.get(&key))
                .cloned()
                .flatten();

            match newest {
                Some(value) => {
                    self.current = Some((key, value));
                    return;
                }
                None => from = Bound::Excluded(key),
            }
        }
    }
}

impl EngineIterator for MemIterator {
    fn seek(&mut self, key: &MvccKey) {
        self.position(Bound::Included(key.clone()));
    }

    fn valid(&self) -> Result<bool, EngineError> {
        Ok(self.current.is_some())
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(key));
        }
    }

    fn next_key(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Included(key.next_logical()));
        }
    }

    fn key(&self) -> Option<&MvccKey> {
        self.current.as_ref().map(|(k, _)| k)
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }
}

struct EngineState {
    memtable: Arc<Segment>,
    segments: Vec<Arc<Segment>>,
    closed: bool,
}

impl EngineState {
    fn view(&self) -> LayeredView {
        let mut layers = self.segments.clone();
        layers.push(self.memtable.clone());
        LayeredView { layers }
    }
}

/// In-memory engine with flushable segments.
pub struct MemEngine {
    state: RwLock<EngineState>,
    next_segment_id: AtomicU64,
    open_snapshots: Arc<AtomicUsize>,
}

impl MemEngine {
    pub fn new() -> Self {
        MemEngine {
            state: RwLock::new(EngineState {
                memtable: Arc::new(Segment::new(0)),
                segments: Vec::new(),
                closed: false,
            }),
            next_segment_id: AtomicU64::new(1),
            open_snapshots: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a snapshot with its concrete type.
    pub fn snapshot(&self) -> Result<MemSnapshot, EngineError> {
        let state = self.state.read();
        if state.closed {
            return Err(EngineError::Closed);
        }
        self.open_snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(MemSnapshot {
            view: state.view(),
            open_snapshots: self.open_snapshots.clone(),
        })
    }

    /// Open a cursor with its concrete type.
    pub fn iter(&self, opts: IterOptions) -> Result<MemIterator, EngineError> {
        let state = self.state.read();
        if state.closed {
            return Err(EngineError::Closed);
        }
        Ok(state.view().iterator(opts))
    }

    /// Snapshots taken and not yet dropped.
    pub fn open_snapshots(&self) -> usize {
        self.open_snapshots.load(Ordering::SeqCst)
    }

    /// Number of flushed segments.
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Bounds of every flushed segment, oldest first.
    pub fn segment_bounds(&self) -> Vec<SegmentBounds> {
        self.state.read().segments.iter().map(|s| s.bounds).collect()
    }

    /// Reject all further reads and writes. Existing snapshots stay usable.
    pub fn close(&self) {
        self.state.write().closed = true;
    }

    fn write(&self, key: MvccKey, value: Option<Vec<u8>>) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(EngineError::Closed);
        }
        Arc::make_mut(&mut state.memtable).write(key, value);
        Ok(())
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader for MemEngine {
    fn get(&self, key: &MvccKey) -> Result<Option<Vec<u8>>, EngineError> {
        let state = self.state.read();
        if state.closed {
            return Err(EngineError::Closed);
        }
        Ok(state.view().get(key))
    }

    fn new_iterator(&self, opts: IterOptions) -> Result<Box<dyn EngineIterator + '_>, EngineError> {
        Ok(Box::new(self.iter(opts)?))
    }
}

impl Writer for MemEngine {
    fn put(&self, key: MvccKey, value: Vec<u8>) -> Result<(), EngineError> {
        self.write(key, Some(value))
    }

    fn clear(&self, key: &MvccKey) -> Result<(), EngineError> {
        self.write(key.clone(), None)
    }
}

impl Engine for MemEngine {
    fn new_snapshot(&self) -> Result<Box<dyn Snapshot>, EngineError> {
        Ok(Box::new(self.snapshot()?))
    }

    fn flush(&self) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.memtable.is_empty() {
            return Ok(());
        }

        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let frozen = std::mem::replace(&mut state.memtable, Arc::new(Segment::new(0)));
        let mut segment = Arc::unwrap_or_clone(frozen);
        segment.id = id;

        debug!(
            segment = id,
            entries = segment.len(),
            min = ?segment.bounds.min,
            max = ?segment.bounds.max,
            "flushed memtable"
        );
        state.segments.push(Arc::new(segment));
        Ok(())
    }
}

/// A point-in-time view of a [`MemEngine`].
pub struct MemSnapshot {
    view: LayeredView,
    open_snapshots: Arc<AtomicUsize>,
}

impl MemSnapshot {
    pub fn iter(&self, opts: IterOptions) -> MemIterator {
        self.view.iterator(opts)
    }
}

impl Reader for MemSnapshot {
    fn get(&self, key: &MvccKey) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.view.get(key))
    }

    fn new_iterator(&self, opts: IterOptions) -> Result<Box<dyn EngineIterator + '_>, EngineError> {
        Ok(Box::new(self.iter(opts)))
    }
}

impl Snapshot for MemSnapshot {}

impl Drop for MemSnapshot {
    fn drop(&mut self) {
        self.open_snapshots.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    fn collect(iter: &mut dyn EngineIterator) -> Vec<MvccKey> {
        let mut keys = Vec::new();
        iter.seek(&MvccKey::meta(""));
        while iter.valid().unwrap() {
            keys.push(iter.key().unwrap().clone());
            iter.next();
        }
        keys
    }

    #[test]
    fn test_newest_layer_wins() {
        let engine = MemEngine::new();
        let k = MvccKey::version("a", ts(1));
        engine.put(k.clone(), b"old".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.put(k.clone(), b"new".to_vec()).unwrap();

        assert_eq!(engine.get(&k).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_deletion_marker_hides_older_segment() {
        let engine = MemEngine::new();
        let k = MvccKey::version("a", ts(1));
        engine.put(k.clone(), b"v".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.clear(&k).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get(&k).unwrap(), None);
        let mut iter = engine.iter(IterOptions::full()).unwrap();
        assert!(collect(&mut iter).is_empty());
    }

    #[test]
    fn test_merged_order_across_layers() {
        let engine = MemEngine::new();
        engine.put(MvccKey::version("b", ts(1)), b"b1".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.put(MvccKey::version("a", ts(2)), b"a2".to_vec()).unwrap();
        engine.put(MvccKey::version("b", ts(3)), b"b3".to_vec()).unwrap();

        let mut iter = engine.iter(IterOptions::full()).unwrap();
        assert_eq!(
            collect(&mut iter),
            vec![
                MvccKey::version("a", ts(2)),
                MvccKey::version("b", ts(3)),
                MvccKey::version("b", ts(1)),
            ]
        );
    }

    #[test]
    fn test_next_key_skips_versions() {
        let engine = MemEngine::new();
        engine.put(MvccKey::version("a", ts(2)), b"a2".to_vec()).unwrap();
        engine.put(MvccKey::version("a", ts(1)), b"a1".to_vec()).unwrap();
        engine.put(MvccKey::version("b", ts(1)), b"b1".to_vec()).unwrap();

        let mut iter = engine.iter(IterOptions::full()).unwrap();
        iter.seek(&MvccKey::meta("a"));
        assert_eq!(iter.key(), Some(&MvccKey::version("a", ts(2))));
        iter.next_key();
        assert_eq!(iter.key(), Some(&MvccKey::version("b", ts(1))));
        iter.next_key();
        assert!(!iter.valid().unwrap());
    }

    #[test]
    fn test_time_bounds_skip_disjoint_segments() {
        let engine = MemEngine::new();
        for batch in 0..5 {
            for i in 0..3 {
                let key = format!("k{}", i);
                engine
                    .put(MvccKey::version(key.as_str(), ts(batch * 10 + i + 1)), b"v".to_vec())
                    .unwrap();
            }
            engine.flush().unwrap();
        }
        assert_eq!(engine.segment_count(), 5);

        let all = engine.iter(IterOptions::full()).unwrap();
        assert_eq!(all.layer_count(), 5);

        let one = engine.iter(IterOptions::time_bound(ts(10), ts(19))).unwrap();
        assert_eq!(one.layer_count(), 1);

        let none = engine.iter(IterOptions::time_bound(ts(100), ts(200))).unwrap();
        assert_eq!(none.layer_count(), 0);
    }

    #[test]
    fn test_intent_keeps_segment_visible_below_window() {
        let engine = MemEngine::new();
        let txn = sdx_core::TxnMeta::new("a", ts(5));
        let meta = MvccMetadata::intent(&txn, 1).encode().unwrap();
        engine.put(MvccKey::meta("a"), meta).unwrap();
        engine.put(MvccKey::version("a", ts(5)), b"v".to_vec()).unwrap();
        engine.flush().unwrap();

        let bounds = engine.segment_bounds()[0];
        assert_eq!(bounds.min_intent, Some(ts(5)));
        // Versions sit below the window, but the intent could still commit into it.
        assert!(bounds.may_contain(&TimeBounds::new(ts(10), ts(20))));
        assert!(!bounds.may_contain(&TimeBounds::new(ts(1), ts(4))));
    }

    #[test]
    fn test_snapshot_is_isolated_and_counted() {
        let engine = MemEngine::new();
        let k = MvccKey::version("a", ts(1));
        engine.put(k.clone(), b"v1".to_vec()).unwrap();

        let snap = engine.snapshot().unwrap();
        assert_eq!(engine.open_snapshots(), 1);

        engine.put(k.clone(), b"v2".to_vec()).unwrap();
        engine.put(MvccKey::version("b", ts(1)), b"x".to_vec()).unwrap();

        assert_eq!(snap.get(&k).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(snap.get(&MvccKey::version("b", ts(1))).unwrap(), None);
        assert_eq!(engine.get(&k).unwrap(), Some(b"v2".to_vec()));

        drop(snap);
        assert_eq!(engine.open_snapshots(), 0);
    }

    #[test]
    fn test_closed_engine_rejects_access() {
        let engine = MemEngine::new();
        let snap = engine.snapshot().unwrap();
        engine.close();

        assert_eq!(engine.get(&MvccKey::meta("a")), Err(EngineError::Closed));
        assert!(engine.put(MvccKey::meta("a"), Vec::new()).is_err());
        assert!(snap.get(&MvccKey::meta("a")).is_ok());
    }
}
