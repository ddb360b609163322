//! The incremental iterator.
//!
//! Yields every version committed in `(start_time, end_time]` over a key span,
//! in key order and, within a key, newest first. Tombstones are yielded like
//! any other version.
//!
//! Two cursors cooperate:
//!
//! - the *version cursor* walks candidate entries. With time-bound iteration
//!   enabled it is opened with the window as a hint, so the engine can skip
//!   whole segments that provably hold nothing relevant;
//! - the *meta cursor* always sees the full engine view. It is consulted once
//!   per logical key to find an outstanding intent.
//!
//! The hint never changes the output: any in-window version and any
//! in-window intent lives in a segment the hint keeps, and every intent
//! decision is made against the full view.

use crate::error::IterError;
use sdx_core::{Key, MvccKey, MvccKeyValue, MvccMetadata, Timestamp};
use sdx_engine::{EngineIterator, IterOptions, Reader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for incremental iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalIterConfig {
    /// Open the version cursor with time bounds so the engine can skip
    /// segments outside the window.
    pub time_bound_iterators: bool,
}

impl Default for IncrementalIterConfig {
    fn default() -> Self {
        IncrementalIterConfig {
            time_bound_iterators: true,
        }
    }
}

/// Where the iterator stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterState {
    /// At the first entry of a logical key whose metadata hasn't been checked.
    AtMeta,

    /// At a version inside the window, ready to be read.
    AtVersion,

    /// No more entries in the span.
    Exhausted,

    /// Stopped on an error; see [`IncrementalIterator::error`].
    Errored,
}

/// What to do with the entry under the version cursor.
enum Step {
    Exhausted,
    NewKey(Key),
    Skip,
    SkipKey,
    Yield,
}

/// Cursor over the versions committed inside a time window.
///
/// ```rust
/// use sdx_core::{Key, Timestamp};
/// use sdx_engine::{mvcc_put, MemEngine};
/// use sdx_incremental::IncrementalIterator;
///
/// let engine = MemEngine::new();
/// let t = Timestamp::from_wall;
/// mvcc_put(&engine, &Key::from("/db1"), t(1), b"val1", None).unwrap();
/// mvcc_put(&engine, &Key::from("/db1"), t(2), b"val2", None).unwrap();
///
/// let mut iter = IncrementalIterator::new(&engine, t(1), t(2)).unwrap();
/// iter.reset(&Key::min(), &Key::max());
/// assert!(iter.valid());
/// assert_eq!(iter.value(), Some(&b"val2"[..]));
/// iter.next();
/// assert!(!iter.valid());
/// assert!(iter.error().is_none());
/// ```
pub struct IncrementalIterator<'a> {
    start_time: Timestamp,
    end_time: Timestamp,
    version: Box<dyn EngineIterator + 'a>,
    meta: Box<dyn EngineIterator + 'a>,
    end_key: Key,
    cur_key: Option<Key>,
    state: IterState,
    err: Option<IterError>,
    cancel: Option<CancellationToken>,
}

impl<'a> IncrementalIterator<'a> {
    /// Create an iterator over `(start_time, end_time]` with default configuration.
    pub fn new<R: Reader + ?Sized>(
        reader: &'a R,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Result<Self, IterError> {
        Self::with_config(reader, start_time, end_time, &IncrementalIterConfig::default())
    }

    /// Create an iterator over `(start_time, end_time]`.
    ///
    /// The iterator is unpositioned until [`reset`](Self::reset).
    pub fn with_config<R: Reader + ?Sized>(
        reader: &'a R,
        start_time: Timestamp,
        end_time: Timestamp,
        config: &IncrementalIterConfig,
    ) -> Result<Self, IterError> {
        let version_opts = if config.time_bound_iterators {
            IterOptions::time_bound(start_time, end_time)
        } else {
            IterOptions::full()
        };

        Ok(IncrementalIterator {
            start_time,
            end_time,
            version: reader.new_iterator(version_opts)?,
            meta: reader.new_iterator(IterOptions::full())?,
            end_key: Key::min(),
            cur_key: None,
            state: IterState::Exhausted,
            err: None,
            cancel: None,
        })
    }

    /// Stop with [`IterError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Position at the first qualifying version in `[start_key, end_key)`.
    pub fn reset(&mut self, start_key: &Key, end_key: &Key) {
        self.err = None;
        self.cur_key = None;
        self.end_key = end_key.clone();

        // No version is both > start_time and <= end_time.
        if self.start_time >= self.end_time || start_key >= end_key {
            self.state = IterState::Exhausted;
            return;
        }

        self.version.seek(&MvccKey::meta(start_key.clone()));
        self.state = IterState::AtMeta;
        self.advance();
    }

    /// Whether the iterator is positioned at a version.
    pub fn valid(&self) -> bool {
        self.state == IterState::AtVersion
    }

    /// Advance to the next qualifying version.
    pub fn next(&mut self) {
        if self.state != IterState::AtVersion {
            return;
        }
        self.version.next();
        self.advance();
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    /// The current versioned key.
    pub fn key(&self) -> Option<&MvccKey> {
        if self.valid() {
            self.version.key()
        } else {
            None
        }
    }

    /// The current value; empty for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        if self.valid() {
            self.version.value()
        } else {
            None
        }
    }

    /// The error that stopped the iterator. Only set once it is no longer valid.
    pub fn error(&self) -> Option<&IterError> {
        self.err.as_ref()
    }

    /// Drain the remaining versions, or return the error that stopped iteration.
    ///
    /// The error stays available through [`error`](Self::error).
    pub fn collect_kvs(&mut self) -> Result<Vec<MvccKeyValue>, IterError> {
        let mut kvs = Vec::new();
        while self.valid() {
            if let (Some(k), Some(v)) = (self.version.key(), self.version.value()) {
                kvs.push(MvccKeyValue::new(k.clone(), v));
            }
            self.next();
        }
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(kvs),
        }
    }

    /// Release the engine cursors.
    pub fn close(self) {}

    fn fail(&mut self, err: IterError) {
        self.state = IterState::Errored;
        self.err = Some(err);
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |c| c.is_cancelled())
    }

    fn advance(&mut self) {
        loop {
            if self.cancelled() {
                self.fail(IterError::Cancelled);
                return;
            }
            match self.version.valid() {
                Ok(true) => {}
                Ok(false) => {
                    self.state = IterState::Exhausted;
                    return;
                }
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }

            let step = match self.version.key() {
                None => Step::Exhausted,
                Some(k) if k.key >= self.end_key => Step::Exhausted,
                Some(k)
                    if self.state == IterState::AtMeta || self.cur_key.as_ref() != Some(&k.key) =>
                {
                    Step::NewKey(k.key.clone())
                }
                Some(k) if !k.is_value() || k.timestamp > self.end_time => Step::Skip,
                Some(k) if k.timestamp <= self.start_time => Step::SkipKey,
                Some(_) => Step::Yield,
            };

            match step {
                Step::Exhausted => {
                    self.state = IterState::Exhausted;
                    return;
                }
                Step::NewKey(key) => {
                    self.state = IterState::AtMeta;
                    if let Err(e) = self.check_intent(&key) {
                        self.fail(e);
                        return;
                    }
                    self.cur_key = Some(key);
                    // Walking this key's versions; settles on the next Yield.
                    self.state = IterState::AtVersion;
                }
                Step::Skip => self.version.next(),
                Step::SkipKey => self.version.next_key(),
                Step::Yield => {
                    self.state = IterState::AtVersion;
                    return;
                }
            }
        }
    }

    /// Fail if `key` carries an intent that could commit inside the window.
    ///
    /// Commit can only move an intent's timestamp forward, so only intents
    /// above `end_time` are provably outside.
    fn check_intent(&mut self, key: &Key) -> Result<(), IterError> {
        let target = MvccKey::meta(key.clone());
        self.meta.seek(&target);
        if !self.meta.valid()? {
            return Ok(());
        }

        let bytes = match (self.meta.key(), self.meta.value()) {
            (Some(k), Some(v)) if *k == target => v,
            _ => return Ok(()),
        };
        let meta = MvccMetadata::decode(bytes).map_err(|source| IterError::Decode {
            key: key.clone(),
            source: Arc::new(source),
        })?;

        match meta.txn {
            None => Err(IterError::InlineValue { key: key.clone() }),
            Some(txn) if meta.timestamp <= self.end_time => {
                debug!(%key, txn = %txn.id, intent_ts = %meta.timestamp, "conflicting intent");
                Err(IterError::ConflictingIntents {
                    key: key.clone(),
                    txn,
                })
            }
            Some(_) => Ok(()),
        }
    }
}
