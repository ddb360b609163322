//! Replica descriptors.

use crate::key::Key;
use serde::{Deserialize, Serialize};

/// Identifies a range of the keyspace.
pub type RangeId = u64;

/// The contiguous span `[start_key, end_key)` a replica holds.
///
/// Owned by the replication layer; read-only everywhere in this workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Key,
    pub end_key: Key,
}

impl RangeDescriptor {
    pub fn new(range_id: RangeId, start_key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        RangeDescriptor {
            range_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }
}
