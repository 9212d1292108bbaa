//! The reference scenarios on 512-byte blocks.

use crate::e2e_tests::helpers::*;

#[test]
fn test_seven_keys_sorted_count_and_remove() {
    let (store, _dir) = new_test_store().expect("create store");
    for (i, k) in [5u8, 3, 8, 1, 9, 2, 7].into_iter().enumerate() {
        let key = [b'0' + k];
        let docid = format!("doc{i}");
        store
            .insert(&key, docid.as_bytes(), format!("v{k}").as_bytes())
            .expect("insert");
    }
    store.drain().expect("drain");

    let expected: Vec<Vec<u8>> = [1u8, 2, 3, 5, 7, 8, 9].iter().map(|k| vec![b'0' + k]).collect();
    assert_eq!(keys(&store), expected);
    assert_eq!(store.count().expect("count"), 7);

    assert!(store.remove(b"5", b"doc0").expect("remove"));
    assert!(collect(store.lookup(b"5")).is_empty());
    assert!(!store.contains(b"5").expect("contains"));
    assert_eq!(store.count().expect("count"), 6);

    store.close().expect("close");
}

#[test]
fn test_two_splits_pass_check_after_drain() {
    let (store, _dir) = new_test_store().expect("create store");
    assert_eq!(store.config().block_size, 512);

    // 16 keys per block, so 100 entries split well past twice
    insert_all(&store, 0..100);
    store.drain().expect("drain");
    assert!(store.check().expect("check"));

    let stats = store.stats().expect("stats");
    assert!(stats.levels.len() >= 2, "levels: {:?}", stats.levels);
    assert!(stats.levels.last().copied().unwrap_or(0) >= 3);
    assert_eq!(store.count().expect("count"), 100);

    store.close().expect("close");
}

#[test]
fn test_docid_and_value_sets_follow_entry_order() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, [30, 10, 20]);
    store.insert(&key(10), b"doc-extra", b"extra").expect("insert duplicate key");

    let docids: Vec<Vec<u8>> = collect(store.docid_set()).iter().map(|d| d.to_vec()).collect();
    assert_eq!(docids, vec![b"doc-extra".to_vec(), docid(10), docid(20), docid(30)]);
    let values: Vec<Vec<u8>> = collect(store.value_set()).iter().map(|v| v.to_vec()).collect();
    assert_eq!(values, vec![b"extra".to_vec(), value(10), value(20), value(30)]);
    store.close().expect("close");
}

#[test]
fn test_front_and_equals() {
    let (store, _dir) = new_test_store().expect("create store");
    assert!(store.front().expect("front").is_none());

    insert_all(&store, [40, 10, 30, 20]);
    let front = store.front().expect("front").expect("non-empty store");
    assert_eq!(&*front.key, key(10).as_slice());
    assert_eq!(&*front.docid, docid(10).as_slice());
    assert_eq!(&*front.value, value(10).as_slice());

    assert!(store.equals(&key(30), &docid(30)).expect("equals"));
    assert!(!store.equals(&key(30), &docid(31)).expect("equals"));
    assert!(!store.equals(&key(31), &docid(30)).expect("equals"));

    store.close().expect("close");
}

#[test]
#[should_panic(expected = "already present")]
fn test_duplicate_insert_is_fatal() {
    let (store, _dir) = new_test_store().expect("create store");
    store.insert(b"k", b"d", b"v1").expect("first insert");
    let _ = store.insert(b"k", b"d", b"v2");
}
