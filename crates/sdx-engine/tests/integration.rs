//! Integration tests for the segmented in-memory engine.

use proptest::prelude::*;
use sdx_core::{Key, MvccKey, Timestamp};
use sdx_engine::{
    mvcc_delete_range, mvcc_get, mvcc_put, Engine, IterOptions, MemEngine, Reader, TimeBounds,
    Writer,
};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, i64),
    Clear(u8, i64),
    Flush,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16, 1i64..50).prop_map(|(k, t)| Op::Put(k, t)),
        2 => (0u8..16, 1i64..50).prop_map(|(k, t)| Op::Clear(k, t)),
        1 => Just(Op::Flush),
    ]
}

fn mvcc_key(k: u8, t: i64) -> MvccKey {
    MvccKey::version(format!("k{:02}", k).as_str(), Timestamp::from_wall(t))
}

fn scan<R: Reader + ?Sized>(reader: &R, opts: IterOptions) -> Vec<(MvccKey, Vec<u8>)> {
    let mut iter = reader.new_iterator(opts).unwrap();
    iter.seek(&MvccKey::meta(Key::min()));
    let mut out = Vec::new();
    while iter.valid().unwrap() {
        out.push((iter.key().unwrap().clone(), iter.value().unwrap().to_vec()));
        iter.next();
    }
    out
}

proptest! {
    #[test]
    fn prop_merged_view_matches_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let engine = MemEngine::new();
        let mut model = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Put(k, t) => {
                    let value = format!("{}@{}", k, t).into_bytes();
                    engine.put(mvcc_key(k, t), value.clone()).unwrap();
                    model.insert(mvcc_key(k, t), value);
                }
                Op::Clear(k, t) => {
                    engine.clear(&mvcc_key(k, t)).unwrap();
                    model.remove(&mvcc_key(k, t));
                }
                Op::Flush => engine.flush().unwrap(),
            }
        }

        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(scan(&engine, IterOptions::full()), expected.clone());

        let snapshot = engine.new_snapshot().unwrap();
        engine.put(mvcc_key(99, 1), b"late".to_vec()).unwrap();
        prop_assert_eq!(scan(snapshot.as_ref(), IterOptions::full()), expected);
    }

    #[test]
    fn prop_time_bounds_keep_every_window_version(
        ops in prop::collection::vec(op_strategy(), 1..60),
        start in 0i64..50,
        span in 0i64..20,
    ) {
        let engine = MemEngine::new();
        for op in &ops {
            match *op {
                Op::Put(k, t) => engine.put(mvcc_key(k, t), vec![k]).unwrap(),
                Op::Clear(k, t) => engine.clear(&mvcc_key(k, t)).unwrap(),
                Op::Flush => engine.flush().unwrap(),
            }
        }

        let tb = TimeBounds::new(Timestamp::from_wall(start), Timestamp::from_wall(start + span));
        let in_window = |entries: Vec<(MvccKey, Vec<u8>)>| -> Vec<(MvccKey, Vec<u8>)> {
            entries.into_iter().filter(|(k, _)| tb.contains(k.timestamp)).collect()
        };

        let full = in_window(scan(&engine, IterOptions::full()));
        let bounded = in_window(scan(&engine, IterOptions { time_bounds: Some(tb) }));
        prop_assert_eq!(full, bounded);
    }
}

#[test]
fn test_snapshot_survives_flush_and_writes() {
    let engine = MemEngine::new();
    let key = Key::from("/tsd/cpu/1");
    mvcc_put(&engine, &key, Timestamp::from_wall(1), b"a", None).unwrap();

    let snapshot = engine.snapshot().unwrap();
    mvcc_put(&engine, &key, Timestamp::from_wall(2), b"b", None).unwrap();
    engine.flush().unwrap();

    assert_eq!(
        mvcc_get(&snapshot, &key, Timestamp::MAX).unwrap(),
        Some(b"a".to_vec())
    );
    assert_eq!(
        mvcc_get(&engine, &key, Timestamp::MAX).unwrap(),
        Some(b"b".to_vec())
    );
    assert_eq!(engine.open_snapshots(), 1);
    drop(snapshot);
    assert_eq!(engine.open_snapshots(), 0);
}

#[test]
fn test_delete_range_is_idempotent() {
    let engine = MemEngine::new();
    for i in 0..5 {
        let key = Key::from(format!("/tsd/cpu/{}", i).as_str());
        mvcc_put(&engine, &key, Timestamp::from_wall(1), b"x", None).unwrap();
    }
    engine.flush().unwrap();

    let (start, end) = (Key::from("/tsd/cpu/"), Key::from("/tsd/cpu/3"));
    let at = Timestamp::from_wall(10);
    assert_eq!(mvcc_delete_range(&engine, &start, &end, at).unwrap(), 3);
    let after_first = scan(&engine, IterOptions::full());

    assert_eq!(mvcc_delete_range(&engine, &start, &end, at).unwrap(), 0);
    assert_eq!(scan(&engine, IterOptions::full()), after_first);
    assert_eq!(
        mvcc_get(&engine, &Key::from("/tsd/cpu/4"), Timestamp::MAX).unwrap(),
        Some(b"x".to_vec())
    );
}
