//! Error types for replica maintenance.

use sdx_engine::{EngineError, MvccError};
use sdx_incremental::IterError;
use thiserror::Error;

/// Errors from the cluster client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("delete range failed: {0}")]
    Mvcc(#[from] MvccError),
}

impl ClientError {
    /// An outstanding intent blocked the write; retrying after it resolves can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Mvcc(MvccError::WriteIntent { .. }))
    }
}

/// Errors reading or writing replica-local bookkeeping.
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("bookkeeping for queue {queue}: {source}")]
    Mvcc {
        queue: String,
        #[source]
        source: MvccError,
    },

    #[error("malformed last-processed timestamp for queue {queue}: {source}")]
    Codec {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from pruning time-series data.
#[derive(Error, Debug)]
pub enum PruneError {
    /// Scanning the snapshot failed. Conflicting intents land here.
    #[error("time series scan failed: {0}")]
    Scan(#[from] IterError),

    #[error("time series delete failed: {0}")]
    Client(#[from] ClientError),

    #[error("time series pruning cancelled")]
    Cancelled,
}

impl PruneError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PruneError::Scan(e) => e.is_retryable(),
            PruneError::Client(e) => e.is_retryable(),
            PruneError::Cancelled => false,
        }
    }
}

/// Errors from processing a replica.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to snapshot engine: {0}")]
    Snapshot(#[from] EngineError),

    #[error(transparent)]
    Prune(PruneError),

    #[error("processing cancelled")]
    Cancelled,
}

impl From<PruneError> for ProcessError {
    fn from(err: PruneError) -> Self {
        match err {
            PruneError::Cancelled | PruneError::Scan(IterError::Cancelled) => {
                ProcessError::Cancelled
            }
            other => ProcessError::Prune(other),
        }
    }
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Prune(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdx_core::{Key, TxnMeta, Timestamp};

    #[test]
    fn test_cancellation_collapses() {
        let err: ProcessError = PruneError::Scan(IterError::Cancelled).into();
        assert!(matches!(err, ProcessError::Cancelled));
        let err: ProcessError = PruneError::Cancelled.into();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_intents_are_retryable() {
        let txn = TxnMeta::new("/tsd/cpu/1", Timestamp::from_wall(5));
        let scan = PruneError::Scan(IterError::ConflictingIntents {
            key: Key::from("/tsd/cpu/1"),
            txn: txn.clone(),
        });
        assert!(scan.is_retryable());
        assert!(ProcessError::from(scan).is_retryable());

        let write = ClientError::Mvcc(MvccError::WriteIntent {
            key: Key::from("/tsd/cpu/1"),
            txn,
        });
        assert!(PruneError::Client(write).is_retryable());
        let zero = ClientError::Mvcc(MvccError::ZeroTimestamp {
            key: Key::from("/tsd/cpu/1"),
        });
        assert!(!PruneError::Client(zero).is_retryable());
    }
}
