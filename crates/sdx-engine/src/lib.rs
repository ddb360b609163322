//! # sdx-engine
//!
//! The versioned storage engine underneath Sardonyx.
//!
//! This crate provides:
//! - Engine traits: [`Reader`], [`Writer`], [`Engine`], [`Snapshot`] and the
//!   raw [`EngineIterator`] cursor
//! - [`MemEngine`]: an in-memory engine organized as flushed, immutable
//!   segments that carry min/max timestamp metadata ("time-bound hints")
//! - MVCC primitives: transactional puts and deletes, intent resolution,
//!   point reads and an idempotent delete-range
//!
//! ## Example
//!
//! ```rust
//! use sdx_core::{Key, Timestamp};
//! use sdx_engine::{mvcc_get, mvcc_put, Engine, MemEngine};
//!
//! let engine = MemEngine::new();
//! let key = Key::from("/db1");
//! mvcc_put(&engine, &key, Timestamp::from_wall(1), b"val1", None).unwrap();
//! engine.flush().unwrap();
//!
//! let value = mvcc_get(&engine, &key, Timestamp::from_wall(2)).unwrap();
//! assert_eq!(value, Some(b"val1".to_vec()));
//! ```

mod engine;
mod error;
mod mem;
mod mvcc;

pub use engine::{Engine, EngineIterator, IterOptions, Reader, Snapshot, TimeBounds, Writer};
pub use error::{EngineError, MvccError};
pub use mem::{MemEngine, MemIterator, MemSnapshot, Segment, SegmentBounds};
pub use mvcc::{
    mvcc_delete, mvcc_delete_range, mvcc_get, mvcc_get_metadata, mvcc_put,
    mvcc_resolve_write_intent,
};
