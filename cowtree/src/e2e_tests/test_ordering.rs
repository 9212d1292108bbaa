//! Sort order and round trips under shuffled workloads.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::e2e_tests::helpers::*;

#[test]
fn test_shuffled_inserts_come_back_sorted() {
    let (store, _dir) = new_test_store().expect("create store");
    let mut ns: Vec<u32> = (0..500).collect();
    ns.shuffle(&mut StdRng::seed_from_u64(7));
    insert_all(&store, ns.iter().copied());

    let expected: Vec<Vec<u8>> = (0..500).map(key).collect();
    assert_eq!(keys(&store), expected);
    assert_eq!(store.count().expect("count"), 500);

    let entries = collect(store.full_set());
    assert_eq!(entries.len(), 500);
    for (n, entry) in (0..500).zip(&entries) {
        assert_eq!(&*entry.key, key(n).as_slice());
        assert_eq!(&*entry.docid, docid(n).as_slice());
        assert_eq!(&*entry.value, value(n).as_slice());
    }

    let values: Vec<Vec<u8>> = collect(store.value_set()).iter().map(|v| v.to_vec()).collect();
    assert_eq!(values, (0..500).map(value).collect::<Vec<_>>());

    store.close().expect("close");
}

#[test]
fn test_duplicate_keys_ordered_by_docid() {
    let (store, _dir) = new_test_store().expect("create store");
    let mut docids: Vec<u32> = (0..60).collect();
    docids.shuffle(&mut StdRng::seed_from_u64(11));
    for d in &docids {
        store
            .insert(b"shared", &docid(*d), &value(*d))
            .expect("insert duplicate key");
    }
    insert_all(&store, [1, 2, 3]);

    let looked_up: Vec<Vec<u8>> = collect(store.lookup(b"shared")).iter().map(|v| v.to_vec()).collect();
    assert_eq!(looked_up, (0..60).map(value).collect::<Vec<_>>());

    let docid_order: Vec<Vec<u8>> = collect(store.docid_set()).iter().map(|d| d.to_vec()).collect();
    let mut expected: Vec<Vec<u8>> = [1, 2, 3].into_iter().map(docid).collect();
    expected.extend((0..60).map(docid));
    assert_eq!(docid_order, expected);

    let pairs: Vec<(Vec<u8>, Vec<u8>)> = collect(store.full_set())
        .into_iter()
        .map(|entry| (entry.key.to_vec(), entry.docid.to_vec()))
        .collect();
    assert!(pairs.windows(2).all(|pair| pair[0] < pair[1]));

    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_lookup_of_missing_key_between_entries() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, (0..80).map(|n| n * 2));
    assert!(collect(store.lookup(&key(41))).is_empty());
    assert!(!store.contains(&key(41)).expect("contains"));
    assert_eq!(collect(store.lookup(&key(42))).len(), 1);
    store.close().expect("close");
}

#[test]
fn test_mixed_workload_matches_model() {
    let (store, _dir) = new_test_store().expect("create store");
    let mut rng = StdRng::seed_from_u64(2024);
    let mut model = std::collections::BTreeSet::new();

    let mut ns: Vec<u32> = (0..300).collect();
    for round in 0..3 {
        ns.shuffle(&mut rng);
        for &n in &ns[..150] {
            if model.contains(&n) {
                assert!(store.remove(&key(n), &docid(n)).expect("remove"));
                model.remove(&n);
            } else {
                store.insert(&key(n), &docid(n), &value(n)).expect("insert");
                model.insert(n);
            }
        }
        let expected: Vec<Vec<u8>> = model.iter().map(|n| key(*n)).collect();
        assert_eq!(keys(&store), expected, "round {round}");
        store.drain().expect("drain");
        assert!(store.check().expect("check"), "round {round}");
    }
    store.close().expect("close");
}
