//! MVCC operations over a raw engine.
//!
//! These maintain the per-key layout described in `sdx_core::mvcc`: an
//! optional metadata record while an intent is outstanding, followed by
//! versions newest first.

use crate::engine::{IterOptions, Reader, Writer};
use crate::error::{MvccError, Result};
use sdx_core::{Intent, Key, MvccKey, MvccMetadata, Timestamp, TxnMeta, TxnStatus};
use tracing::trace;

/// Read the metadata record of `key`, if any.
pub fn mvcc_get_metadata<R: Reader + ?Sized>(
    reader: &R,
    key: &Key,
) -> Result<Option<MvccMetadata>> {
    match reader.get(&MvccKey::meta(key.clone()))? {
        Some(bytes) => MvccMetadata::decode(&bytes)
            .map(Some)
            .map_err(|source| MvccError::Decode {
                key: key.clone(),
                source,
            }),
        None => Ok(None),
    }
}

/// The newest version of `key` at or below `max`, skipping the metadata record.
fn newest_version<R: Reader + ?Sized>(
    reader: &R,
    key: &Key,
    max: Timestamp,
) -> Result<Option<(Timestamp, Vec<u8>)>> {
    let mut iter = reader.new_iterator(IterOptions::full())?;
    iter.seek(&MvccKey::version(key.clone(), max));
    while iter.valid()? {
        let Some(k) = iter.key() else { break };
        if k.key != *key {
            break;
        }
        if k.is_value() {
            let ts = k.timestamp;
            let value = iter.value().unwrap_or_default().to_vec();
            return Ok(Some((ts, value)));
        }
        iter.next();
    }
    Ok(None)
}

/// Write `value` at `timestamp`, transactionally if `txn` is given.
///
/// A transactional write records a metadata entry marking the version as an
/// intent. A transaction may overwrite its own intent; any other writer hits
/// [`MvccError::WriteIntent`]. A non-transactional write below an existing
/// committed version fails with [`MvccError::WriteTooOld`]. The zero
/// timestamp addresses the metadata record and is rejected with
/// [`MvccError::ZeroTimestamp`].
pub fn mvcc_put<E: Reader + Writer + ?Sized>(
    engine: &E,
    key: &Key,
    timestamp: Timestamp,
    value: &[u8],
    txn: Option<&TxnMeta>,
) -> Result<()> {
    if timestamp.is_empty() {
        return Err(MvccError::ZeroTimestamp { key: key.clone() });
    }
    let existing = mvcc_get_metadata(engine, key)?;

    match (&existing, txn) {
        (Some(meta), Some(txn)) if meta.txn.as_ref().map(|t| t.id) == Some(txn.id) => {
            if meta.timestamp != timestamp {
                engine.clear(&MvccKey::version(key.clone(), meta.timestamp))?;
            }
        }
        (Some(MvccMetadata { txn: Some(owner), .. }), _) => {
            return Err(MvccError::WriteIntent {
                key: key.clone(),
                txn: owner.clone(),
            });
        }
        _ => {
            if let Some((existing, _)) = newest_version(engine, key, Timestamp::MAX)? {
                if existing >= timestamp {
                    return Err(MvccError::WriteTooOld {
                        key: key.clone(),
                        requested: timestamp,
                        existing,
                    });
                }
            }
        }
    }

    if let Some(txn) = txn {
        let mut meta = MvccMetadata::intent(txn, value.len());
        meta.timestamp = timestamp;
        let bytes = meta.encode().map_err(|source| MvccError::Encode {
            key: key.clone(),
            source,
        })?;
        engine.put(MvccKey::meta(key.clone()), bytes)?;
    }
    engine.put(MvccKey::version(key.clone(), timestamp), value.to_vec())?;
    trace!(%key, %timestamp, intent = txn.is_some(), "mvcc put");
    Ok(())
}

/// Write a tombstone for `key` at `timestamp`.
pub fn mvcc_delete<E: Reader + Writer + ?Sized>(
    engine: &E,
    key: &Key,
    timestamp: Timestamp,
    txn: Option<&TxnMeta>,
) -> Result<()> {
    mvcc_put(engine, key, timestamp, &[], txn)
}

/// Read the value of `key` visible at `timestamp`.
///
/// Returns `None` for an absent key or a tombstone. An intent at or below
/// `timestamp` is an error, since its fate is unknown.
pub fn mvcc_get<R: Reader + ?Sized>(
    reader: &R,
    key: &Key,
    timestamp: Timestamp,
) -> Result<Option<Vec<u8>>> {
    if let Some(meta) = mvcc_get_metadata(reader, key)? {
        if let Some(txn) = meta.txn {
            if meta.timestamp <= timestamp {
                return Err(MvccError::WriteIntent { key: key.clone(), txn });
            }
        }
    }
    Ok(newest_version(reader, key, timestamp)?
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty()))
}

/// Tombstone every live key in `[start, end)` at `timestamp`.
///
/// Keys whose newest version is already a tombstone are left alone, so
/// replaying the same delete is a no-op. Returns the number of keys deleted.
pub fn mvcc_delete_range<E: Reader + Writer + ?Sized>(
    engine: &E,
    start: &Key,
    end: &Key,
    timestamp: Timestamp,
) -> Result<usize> {
    if timestamp.is_empty() {
        return Err(MvccError::ZeroTimestamp { key: start.clone() });
    }
    let mut live = Vec::new();
    {
        let mut iter = engine.new_iterator(IterOptions::full())?;
        iter.seek(&MvccKey::meta(start.clone()));
        while iter.valid()? {
            let Some(k) = iter.key() else { break };
            if k.key >= *end {
                break;
            }
            let key = k.key.clone();
            if !k.is_value() {
                let meta = iter.value().map(MvccMetadata::decode).transpose().map_err(|source| {
                    MvccError::Decode {
                        key: key.clone(),
                        source,
                    }
                })?;
                if let Some(txn) = meta.and_then(|m| m.txn) {
                    return Err(MvccError::WriteIntent { key, txn });
                }
                iter.next();
                continue;
            }

            let newest = k.timestamp;
            let tombstone = iter.value().map_or(true, |v| v.is_empty());
            if !tombstone {
                if newest >= timestamp {
                    return Err(MvccError::WriteTooOld {
                        key,
                        requested: timestamp,
                        existing: newest,
                    });
                }
                live.push(key);
            }
            iter.next_key();
        }
    }

    for key in &live {
        engine.put(MvccKey::version(key.clone(), timestamp), Vec::new())?;
    }
    Ok(live.len())
}

/// Resolve the intent `intent.txn` left on `intent.key`.
///
/// Committing keeps the provisional version, moving it to the transaction's
/// final timestamp if it was pushed. Aborting removes it. A pending status
/// only moves a pushed intent forward. Returns whether an intent was found.
pub fn mvcc_resolve_write_intent<E: Reader + Writer + ?Sized>(
    engine: &E,
    intent: &Intent,
) -> Result<bool> {
    let Some(meta) = mvcc_get_metadata(engine, &intent.key)? else {
        return Ok(false);
    };
    let Some(owner) = meta.txn.as_ref() else {
        return Ok(false);
    };
    if owner.id != intent.txn.id {
        return Ok(false);
    }

    let key = &intent.key;
    let provisional = MvccKey::version(key.clone(), meta.timestamp);
    // A commit from a later epoch did not write this version.
    let commit = intent.status == TxnStatus::Committed && intent.txn.epoch == owner.epoch;

    match intent.status {
        TxnStatus::Committed | TxnStatus::Aborted => {
            engine.clear(&MvccKey::meta(key.clone()))?;
            if !commit {
                engine.clear(&provisional)?;
            } else if intent.txn.timestamp != meta.timestamp {
                let value = engine.get(&provisional)?.unwrap_or_default();
                engine.clear(&provisional)?;
                engine.put(MvccKey::version(key.clone(), intent.txn.timestamp), value)?;
            }
        }
        TxnStatus::Pending => {
            if intent.txn.timestamp > meta.timestamp {
                let value = engine.get(&provisional)?.unwrap_or_default();
                let mut pushed = meta.clone();
                pushed.timestamp = intent.txn.timestamp;
                if let Some(txn) = pushed.txn.as_mut() {
                    txn.timestamp = intent.txn.timestamp;
                }
                let bytes = pushed.encode().map_err(|source| MvccError::Encode {
                    key: key.clone(),
                    source,
                })?;
                engine.clear(&provisional)?;
                engine.put(MvccKey::meta(key.clone()), bytes)?;
                engine.put(MvccKey::version(key.clone(), intent.txn.timestamp), value)?;
            }
        }
    }

    trace!(%key, status = ?intent.status, "resolved intent");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemEngine;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    #[test]
    fn test_put_and_get_versions() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        mvcc_put(&engine, &k, ts(1), b"val1", None).unwrap();
        mvcc_put(&engine, &k, ts(2), b"val2", None).unwrap();

        assert_eq!(mvcc_get(&engine, &k, ts(1)).unwrap(), Some(b"val1".to_vec()));
        assert_eq!(mvcc_get(&engine, &k, ts(5)).unwrap(), Some(b"val2".to_vec()));
        assert_eq!(mvcc_get(&engine, &k, ts(0).next()).unwrap(), None);
    }

    #[test]
    fn test_write_too_old() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        mvcc_put(&engine, &k, ts(5), b"v", None).unwrap();

        let err = mvcc_put(&engine, &k, ts(3), b"w", None).unwrap_err();
        assert!(matches!(err, MvccError::WriteTooOld { existing, .. } if existing == ts(5)));
    }

    #[test]
    fn test_zero_timestamp_rejected() {
        let engine = MemEngine::new();
        let k = Key::from("a");

        assert!(matches!(
            mvcc_put(&engine, &k, Timestamp::MIN, b"v", None),
            Err(MvccError::ZeroTimestamp { key }) if key == k
        ));
        assert!(matches!(
            mvcc_delete(&engine, &k, Timestamp::MIN, None),
            Err(MvccError::ZeroTimestamp { .. })
        ));
        assert!(matches!(
            mvcc_delete_range(&engine, &Key::min(), &Key::max(), Timestamp::MIN),
            Err(MvccError::ZeroTimestamp { .. })
        ));

        // Nothing landed in the metadata slot, so the key stays readable.
        assert_eq!(engine.get(&MvccKey::meta("a")).unwrap(), None);
        mvcc_put(&engine, &k, ts(1), b"v", None).unwrap();
        assert_eq!(mvcc_get(&engine, &k, ts(1)).unwrap(), Some(b"v".to_vec()));
        assert_eq!(mvcc_get_metadata(&engine, &k).unwrap(), None);
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        mvcc_put(&engine, &k, ts(1), b"v", None).unwrap();
        mvcc_delete(&engine, &k, ts(2), None).unwrap();

        assert_eq!(mvcc_get(&engine, &k, ts(3)).unwrap(), None);
        assert_eq!(
            engine.get(&MvccKey::version("/db1", ts(2))).unwrap(),
            Some(Vec::new())
        );
    }

    #[test]
    fn test_intent_blocks_other_writers_and_readers() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        let txn = TxnMeta::new("/db1", ts(4));
        mvcc_put(&engine, &k, ts(4), b"val4", Some(&txn)).unwrap();

        assert!(matches!(
            mvcc_put(&engine, &k, ts(6), b"x", None),
            Err(MvccError::WriteIntent { .. })
        ));
        assert!(matches!(mvcc_get(&engine, &k, ts(5)), Err(MvccError::WriteIntent { .. })));
        // Reads below the intent are unaffected.
        assert_eq!(mvcc_get(&engine, &k, ts(3)).unwrap(), None);

        // The owner may rewrite its own intent.
        mvcc_put(&engine, &k, ts(5), b"val5", Some(&txn)).unwrap();
        assert_eq!(engine.get(&MvccKey::version("/db1", ts(4))).unwrap(), None);
    }

    #[test]
    fn test_resolve_commit_and_abort() {
        let engine = MemEngine::new();
        let k1 = Key::from("/db1");
        let k2 = Key::from("/db2");
        let txn1 = TxnMeta::new("/db1", ts(4)).with_epoch(1);
        let txn2 = TxnMeta::new("/db2", ts(4)).with_epoch(1);
        mvcc_put(&engine, &k1, ts(4), b"val4", Some(&txn1)).unwrap();
        mvcc_put(&engine, &k2, ts(4), b"val4", Some(&txn2)).unwrap();

        let commit = Intent::new("/db1", txn1, TxnStatus::Committed);
        let abort = Intent::new("/db2", txn2, TxnStatus::Aborted);
        assert!(mvcc_resolve_write_intent(&engine, &commit).unwrap());
        assert!(mvcc_resolve_write_intent(&engine, &abort).unwrap());

        assert_eq!(mvcc_get(&engine, &k1, ts(5)).unwrap(), Some(b"val4".to_vec()));
        assert_eq!(mvcc_get(&engine, &k2, ts(5)).unwrap(), None);
        assert_eq!(mvcc_get_metadata(&engine, &k1).unwrap(), None);
    }

    #[test]
    fn test_resolve_pushed_commit_moves_version() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        let txn = TxnMeta::new("/db1", ts(4));
        mvcc_put(&engine, &k, ts(4), b"v", Some(&txn)).unwrap();

        let mut pushed = txn.clone();
        pushed.timestamp = ts(7);
        let intent = Intent::new("/db1", pushed, TxnStatus::Committed);
        mvcc_resolve_write_intent(&engine, &intent).unwrap();

        assert_eq!(engine.get(&MvccKey::version("/db1", ts(4))).unwrap(), None);
        assert_eq!(engine.get(&MvccKey::version("/db1", ts(7))).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_resolve_foreign_txn_is_noop() {
        let engine = MemEngine::new();
        let k = Key::from("/db1");
        let txn = TxnMeta::new("/db1", ts(4));
        mvcc_put(&engine, &k, ts(4), b"v", Some(&txn)).unwrap();

        let other = TxnMeta::new("/db1", ts(4));
        let intent = Intent::new("/db1", other, TxnStatus::Aborted);
        assert!(!mvcc_resolve_write_intent(&engine, &intent).unwrap());
        assert!(mvcc_get_metadata(&engine, &k).unwrap().is_some());
    }

    #[test]
    fn test_delete_range_is_idempotent() {
        let engine = MemEngine::new();
        for name in ["a", "b", "c"] {
            mvcc_put(&engine, &Key::from(name), ts(1), b"v", None).unwrap();
        }
        mvcc_delete(&engine, &Key::from("b"), ts(2), None).unwrap();

        let deleted = mvcc_delete_range(&engine, &Key::from("a"), &Key::from("z"), ts(10)).unwrap();
        assert_eq!(deleted, 2);
        let again = mvcc_delete_range(&engine, &Key::from("a"), &Key::from("z"), ts(10)).unwrap();
        assert_eq!(again, 0);

        for name in ["a", "b", "c"] {
            assert_eq!(mvcc_get(&engine, &Key::from(name), ts(11)).unwrap(), None);
        }
    }

    #[test]
    fn test_delete_range_stops_at_intent() {
        let engine = MemEngine::new();
        let txn = TxnMeta::new("b", ts(3));
        mvcc_put(&engine, &Key::from("b"), ts(3), b"v", Some(&txn)).unwrap();

        let err = mvcc_delete_range(&engine, &Key::from("a"), &Key::from("z"), ts(10)).unwrap_err();
        assert!(matches!(err, MvccError::WriteIntent { .. }));
    }
}
