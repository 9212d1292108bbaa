//! Readers against concurrent writers.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::e2e_tests::helpers::*;

#[test]
fn test_lookup_sees_whole_inserts_only() {
    let (store, _dir) = new_test_store().expect("create store");
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for n in 0..400 {
                store.insert(b"hot", &docid(n), &value(n)).expect("insert");
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..3 {
            scope.spawn(|| {
                let mut last = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let seen: Vec<Vec<u8>> = collect(store.lookup(b"hot")).iter().map(|v| v.to_vec()).collect();
                    let len = u32::try_from(seen.len()).expect("small count");
                    let expected: Vec<Vec<u8>> = (0..len).map(value).collect();
                    assert_eq!(seen, expected, "lookup saw a partial insert");
                    assert!(seen.len() >= last, "lookup went back in time");
                    last = seen.len();
                    if finished {
                        break;
                    }
                }
                assert_eq!(last, 400);
            });
        }
    });

    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_open_scan_keeps_its_snapshot() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..60);
    store.drain().expect("drain");

    let mut scan = store.full_set().expect("open scan");
    let first = scan.next().expect("first entry").expect("read entry");
    assert_eq!(&*first.key, key(0).as_slice());

    remove_all(&store, 0..60);
    insert_all(&store, 1000..1060);
    store.drain().expect("drain with a reader pinned");

    let rest: Vec<Vec<u8>> = scan
        .map(|entry| entry.expect("read entry").key.to_vec())
        .collect();
    assert_eq!(rest, (1..60).map(key).collect::<Vec<_>>());

    store.drain().expect("drain after reader left");
    assert!(store.check().expect("check"));
    assert_eq!(keys(&store), (1000..1060).map(key).collect::<Vec<_>>());
    store.close().expect("close");
}

#[test]
fn test_parallel_writers() {
    let (store, _dir) = new_test_store().expect("create store");
    std::thread::scope(|scope| {
        for t in 0..4u32 {
            let store = &store;
            scope.spawn(move || insert_all(store, (0..100).map(|n| t * 1000 + n)));
        }
    });

    assert_eq!(store.count().expect("count"), 400);
    let all = keys(&store);
    assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}
