//! Errors surfaced by incremental iteration.

use sdx_core::{Key, TxnMeta};
use sdx_engine::EngineError;
use std::sync::Arc;
use thiserror::Error;

/// Terminal error of an [`IncrementalIterator`](crate::IncrementalIterator).
#[derive(Error, Debug, Clone)]
pub enum IterError {
    /// An unresolved write whose timestamp may land inside the window.
    #[error("conflicting intents on key {key} from txn {}", txn.id)]
    ConflictingIntents { key: Key, txn: TxnMeta },

    #[error("inline values are unsupported by incremental iteration: {key}")]
    InlineValue { key: Key },

    #[error("incremental iteration cancelled")]
    Cancelled,

    #[error("failed to decode metadata for {key}: {source}")]
    Decode {
        key: Key,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IterError {
    /// Whether re-running the scan later can succeed. Conflicting intents go
    /// away once their transaction resolves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IterError::ConflictingIntents { .. })
    }
}
