//! Error types for the engine and MVCC layers.

use sdx_core::{Key, Timestamp, TxnMeta};
use thiserror::Error;

/// Errors raised by the raw engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is closed")]
    Closed,
}

/// Errors raised by MVCC operations.
#[derive(Error, Debug)]
pub enum MvccError {
    #[error("conflicting intent on key {key} from txn {}", txn.id)]
    WriteIntent { key: Key, txn: TxnMeta },

    #[error("cannot write key {key} at the zero timestamp")]
    ZeroTimestamp { key: Key },

    #[error("write at {requested} on key {key} is older than existing version at {existing}")]
    WriteTooOld {
        key: Key,
        requested: Timestamp,
        existing: Timestamp,
    },

    #[error("failed to decode metadata for {key}: {source}")]
    Decode {
        key: Key,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode metadata for {key}: {source}")]
    Encode {
        key: Key,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, MvccError>;
