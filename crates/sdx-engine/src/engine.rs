//! Engine traits.
//!
//! An engine is a flat, ordered map from [`MvccKey`] to bytes. It knows
//! nothing about transactions; the MVCC layer and the incremental iterator
//! build those semantics on top of the cursor defined here.

use crate::error::EngineError;
use sdx_core::{MvccKey, Timestamp};
use serde::{Deserialize, Serialize};

/// A timestamp window `(start, end]` used to skip storage segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Exclusive lower bound.
    pub start: Timestamp,

    /// Inclusive upper bound.
    pub end: Timestamp,
}

impl TimeBounds {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        TimeBounds { start, end }
    }

    /// Whether `ts` falls inside `(start, end]`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts > self.start && ts <= self.end
    }
}

/// Options for opening a cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterOptions {
    /// When set, the engine may omit whole segments whose metadata proves
    /// they hold no version inside the bounds and no intent at or below the
    /// upper bound. Callers must treat the result as a hint: skipped segments
    /// can hide deletions and metadata that are visible in a full view.
    pub time_bounds: Option<TimeBounds>,
}

impl IterOptions {
    /// A full, unbounded view.
    pub fn full() -> Self {
        IterOptions { time_bounds: None }
    }

    pub fn time_bound(start: Timestamp, end: Timestamp) -> Self {
        IterOptions {
            time_bounds: Some(TimeBounds::new(start, end)),
        }
    }
}

/// A forward cursor over engine entries in [`MvccKey`] order.
pub trait EngineIterator {
    /// Position at the first entry `>= key`.
    fn seek(&mut self, key: &MvccKey);

    /// Whether the cursor is positioned at an entry. An error means the
    /// cursor is unusable.
    fn valid(&self) -> Result<bool, EngineError>;

    /// Advance to the next entry.
    fn next(&mut self);

    /// Advance to the first entry of the next logical key.
    fn next_key(&mut self);

    /// The current key, if positioned.
    fn key(&self) -> Option<&MvccKey>;

    /// The current value, if positioned.
    fn value(&self) -> Option<&[u8]>;
}

/// Read access to an engine or a snapshot of one.
pub trait Reader {
    /// Point lookup of a single entry.
    fn get(&self, key: &MvccKey) -> Result<Option<Vec<u8>>, EngineError>;

    /// Open a cursor. The cursor is unpositioned until the first `seek`.
    fn new_iterator(&self, opts: IterOptions) -> Result<Box<dyn EngineIterator + '_>, EngineError>;
}

/// Write access to an engine.
pub trait Writer {
    fn put(&self, key: MvccKey, value: Vec<u8>) -> Result<(), EngineError>;

    /// Remove an entry.
    fn clear(&self, key: &MvccKey) -> Result<(), EngineError>;
}

/// An immutable point-in-time view. Dropping it releases the view.
pub trait Snapshot: Reader + Send + Sync {}

/// A complete engine.
pub trait Engine: Reader + Writer + Send + Sync {
    /// Take a cheap, immutable point-in-time view.
    fn new_snapshot(&self) -> Result<Box<dyn Snapshot>, EngineError>;

    /// Persist buffered writes as a new immutable segment.
    fn flush(&self) -> Result<(), EngineError>;
}
