//! # sdx-incremental
//!
//! Incremental iteration over a versioned engine: "everything that changed in
//! `(start, end]`" for a key span.
//!
//! This crate provides:
//! - [`IncrementalIterator`]: a forward cursor that yields versions inside a
//!   time window and refuses to proceed past an unresolved intent that could
//!   still commit inside it
//! - [`IncrementalIterConfig`]: whether the engine may skip segments using
//!   their time-bound metadata. The output is the same either way
//! - [`IterError`]: terminal errors, with [`IterError::is_retryable`] for
//!   callers that want to back off and try again
//!
//! ## Example
//!
//! ```rust
//! use sdx_core::{Key, Timestamp};
//! use sdx_engine::{mvcc_put, Engine, MemEngine};
//! use sdx_incremental::IncrementalIterator;
//!
//! let engine = MemEngine::new();
//! let t = Timestamp::from_wall;
//! mvcc_put(&engine, &Key::from("/db1"), t(1), b"val1", None).unwrap();
//! engine.flush().unwrap();
//! mvcc_put(&engine, &Key::from("/db2"), t(2), b"val2", None).unwrap();
//!
//! let mut iter = IncrementalIterator::new(&engine, t(1), t(2)).unwrap();
//! iter.reset(&Key::min(), &Key::max());
//! let changed = iter.collect_kvs().unwrap();
//! assert_eq!(changed.len(), 1);
//! assert_eq!(changed[0].key.key, Key::from("/db2"));
//! ```

mod error;
mod iterator;

pub use error::IterError;
pub use iterator::{IncrementalIterConfig, IncrementalIterator, IterState};
