//! Multi-version keys and the records stored alongside them.
//!
//! Every logical key owns a run of physical entries in the engine:
//!
//! ```text
//! (key, 0)      metadata record, present only while an intent is outstanding
//! (key, t_n)    newest version
//! ...
//! (key, t_1)    oldest version
//! ```
//!
//! An empty value at a version is a tombstone.

use crate::hlc::Timestamp;
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use ulid::Ulid;

/// A logical key paired with a version timestamp.
///
/// A zero timestamp addresses the key's metadata record.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MvccKey {
    pub key: Key,
    pub timestamp: Timestamp,
}

impl MvccKey {
    /// The metadata key for `key`; sorts before every version of `key`.
    pub fn meta(key: impl Into<Key>) -> Self {
        MvccKey {
            key: key.into(),
            timestamp: Timestamp::MIN,
        }
    }

    /// A version key.
    pub fn version(key: impl Into<Key>, timestamp: Timestamp) -> Self {
        MvccKey {
            key: key.into(),
            timestamp,
        }
    }

    /// Whether this addresses a version rather than a metadata record.
    pub fn is_value(&self) -> bool {
        !self.timestamp.is_empty()
    }

    /// The first entry of the next logical key.
    pub fn next_logical(&self) -> MvccKey {
        MvccKey::meta(self.key.next())
    }
}

impl Ord for MvccKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self.timestamp.is_empty(), other.timestamp.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            // Newest version first.
            (false, false) => other.timestamp.cmp(&self.timestamp),
        }
    }
}

impl PartialOrd for MvccKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MvccKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_value() {
            write!(f, "{}/{}", self.key, self.timestamp)
        } else {
            write!(f, "{}", self.key)
        }
    }
}

impl fmt::Debug for MvccKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MvccKey({})", self)
    }
}

/// A versioned key with its value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccKeyValue {
    pub key: MvccKey,
    pub value: Vec<u8>,
}

impl MvccKeyValue {
    pub fn new(key: MvccKey, value: impl Into<Vec<u8>>) -> Self {
        MvccKeyValue {
            key,
            value: value.into(),
        }
    }

    /// Whether this version records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for MvccKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.key,
            Key::new(self.value.clone())
        )
    }
}

/// Identity of a transaction as recorded on its intents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnMeta {
    /// Unique transaction ID.
    pub id: Ulid,

    /// Anchor key of the transaction record.
    pub key: Key,

    /// Restart epoch; bumped when the transaction retries.
    pub epoch: u32,

    /// Provisional commit timestamp.
    pub timestamp: Timestamp,
}

impl TxnMeta {
    /// A fresh transaction anchored at `key`.
    pub fn new(key: impl Into<Key>, timestamp: Timestamp) -> Self {
        TxnMeta {
            id: Ulid::new(),
            key: key.into(),
            epoch: 0,
            timestamp,
        }
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }
}

/// Final disposition of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

/// A request to resolve the intent a transaction left on a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Key,
    pub txn: TxnMeta,
    pub status: TxnStatus,
}

impl Intent {
    pub fn new(key: impl Into<Key>, txn: TxnMeta, status: TxnStatus) -> Self {
        Intent {
            key: key.into(),
            txn,
            status,
        }
    }
}

/// The record stored at a metadata key.
///
/// Written with every transactional write and removed when the intent is
/// resolved. A record without a transaction is an inline value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccMetadata {
    /// Owning transaction, if this is an intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn: Option<TxnMeta>,

    /// Timestamp of the provisional version.
    pub timestamp: Timestamp,

    /// Whether the provisional version is a tombstone.
    #[serde(default)]
    pub deleted: bool,

    /// Size of the provisional value.
    #[serde(default)]
    pub val_bytes: usize,
}

impl MvccMetadata {
    /// Metadata for an intent written by `txn`.
    pub fn intent(txn: &TxnMeta, value_len: usize) -> Self {
        MvccMetadata {
            txn: Some(txn.clone()),
            timestamp: txn.timestamp,
            deleted: value_len == 0,
            val_bytes: value_len,
        }
    }

    pub fn is_intent(&self) -> bool {
        self.txn.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
