//! # sdx-core
//!
//! Shared data model for the Sardonyx versioned key-value store.
//!
//! This crate provides:
//! - Keys: ordered byte strings with successor and prefix helpers
//! - Hybrid logical timestamps and the clock that issues them
//! - MVCC keys (logical key + version timestamp) and their ordering
//! - Transaction metadata, intents and the metadata records engines store
//!
//! ## Example
//!
//! ```rust
//! use sdx_core::{MvccKey, Timestamp};
//!
//! let newer = MvccKey::version("/db1", Timestamp::from_wall(2));
//! let older = MvccKey::version("/db1", Timestamp::from_wall(1));
//!
//! // Versions of a key sort newest first, after the metadata key.
//! assert!(MvccKey::meta("/db1") < newer);
//! assert!(newer < older);
//! ```

mod descriptor;
mod hlc;
mod key;
mod mvcc;

pub use descriptor::{RangeDescriptor, RangeId};
pub use hlc::{Clock, ManualSource, Timestamp};
pub use key::{Key, KEY_MAX, KEY_MIN};
pub use mvcc::{Intent, MvccKey, MvccKeyValue, MvccMetadata, TxnMeta, TxnStatus};
