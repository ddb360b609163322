//! Cluster-wide KV client used to issue time-series deletes.

use crate::error::ClientError;
use async_trait::async_trait;
use sdx_core::{Key, Timestamp};
use sdx_engine::{mvcc_delete_range, Engine};
use std::sync::Arc;
use tracing::trace;

/// Transactional writes against the whole cluster, not just one replica.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Tombstone every live key in `[start, end)` at `timestamp`.
    ///
    /// Returns the number of keys deleted. Keys already deleted are left
    /// alone, so repeating a delete is a no-op.
    async fn delete_range(
        &self,
        start: &Key,
        end: &Key,
        timestamp: Timestamp,
    ) -> Result<usize, ClientError>;
}

/// A client that writes straight into a local engine.
pub struct LocalClient {
    engine: Arc<dyn Engine>,
}

impl LocalClient {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        LocalClient { engine }
    }
}

#[async_trait]
impl KvClient for LocalClient {
    async fn delete_range(
        &self,
        start: &Key,
        end: &Key,
        timestamp: Timestamp,
    ) -> Result<usize, ClientError> {
        let deleted = mvcc_delete_range(self.engine.as_ref(), start, end, timestamp)?;
        trace!(%start, %end, %timestamp, deleted, "delete range");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdx_engine::{mvcc_get, mvcc_put, MemEngine};
    use sdx_core::TxnMeta;

    #[tokio::test]
    async fn test_delete_range_converges() {
        let engine = Arc::new(MemEngine::new());
        for i in 0..3 {
            let key = Key::from(format!("k{}", i).as_str());
            mvcc_put(engine.as_ref(), &key, Timestamp::from_wall(1), b"v", None).unwrap();
        }
        let client = LocalClient::new(engine.clone());
        let at = Timestamp::from_wall(5);

        let first = client.delete_range(&Key::from("k0"), &Key::from("k2"), at).await.unwrap();
        let second = client.delete_range(&Key::from("k0"), &Key::from("k2"), at).await.unwrap();
        assert_eq!((first, second), (2, 0));

        let at_now = Timestamp::from_wall(6);
        assert_eq!(mvcc_get(engine.as_ref(), &Key::from("k1"), at_now).unwrap(), None);
        assert!(mvcc_get(engine.as_ref(), &Key::from("k2"), at_now).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_intent_blocks_delete() {
        let engine = Arc::new(MemEngine::new());
        let key = Key::from("k");
        let txn = TxnMeta::new(key.clone(), Timestamp::from_wall(2));
        mvcc_put(engine.as_ref(), &key, Timestamp::from_wall(2), b"v", Some(&txn)).unwrap();

        let client = LocalClient::new(engine);
        let err = client
            .delete_range(&Key::from("a"), &Key::from("z"), Timestamp::from_wall(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
