//! Removal, rebalancing and block accounting.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::e2e_tests::helpers::*;
use crate::storage::Store;
use crate::testing::init_tracing;

#[test]
fn test_second_remove_is_a_no_op() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..10);

    assert!(store.remove(&key(4), &docid(4)).expect("first remove"));
    let before = store.stats().expect("stats").commits;
    assert!(!store.remove(&key(4), &docid(4)).expect("second remove"));
    assert_eq!(store.stats().expect("stats").commits, before);
    assert!(!store.contains(&key(4)).expect("contains"));
    assert_eq!(store.count().expect("count"), 9);

    store.close().expect("close");
}

#[test]
fn test_remove_with_wrong_docid_keeps_entry() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..3);
    assert!(!store.remove(&key(1), &docid(2)).expect("remove"));
    assert!(store.contains(&key(1)).expect("contains"));
    store.close().expect("close");
}

#[test]
fn test_heavy_remove_keeps_tree_valid() {
    let (store, _dir) = new_test_store().expect("create store");
    let mut rng = StdRng::seed_from_u64(99);
    let mut ns: Vec<u32> = (0..800).collect();
    ns.shuffle(&mut rng);
    insert_all(&store, ns.iter().copied());
    store.drain().expect("drain");
    assert!(store.check().expect("check after inserts"));

    ns.shuffle(&mut rng);
    let (removed, kept) = ns.split_at(700);
    for (i, chunk) in removed.chunks(100).enumerate() {
        remove_all(&store, chunk.iter().copied());
        store.drain().expect("drain");
        assert!(store.check().expect("check"), "after chunk {i}");
    }

    let mut kept: Vec<u32> = kept.to_vec();
    kept.sort_unstable();
    assert_eq!(keys(&store), kept.iter().map(|n| key(*n)).collect::<Vec<_>>());
    assert_eq!(store.count().expect("count"), 100);

    store.close().expect("close");
}

#[test]
fn test_remove_everything_collapses_to_empty_leaf() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..200);
    remove_all(&store, (0..200).rev());

    assert_eq!(store.count().expect("count"), 0);
    assert!(keys(&store).is_empty());
    assert!(store.front().expect("front").is_none());
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    assert_eq!(store.stats().expect("stats").levels, vec![1]);

    insert_all(&store, 0..5);
    assert_eq!(store.count().expect("count"), 5);
    store.close().expect("close");
}

#[test]
fn test_blocks_are_reused_after_removal() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..300);
    store.drain().expect("drain");
    let appended = store.stats().expect("stats").appended_blocks;

    for _ in 0..3 {
        remove_all(&store, 0..300);
        insert_all(&store, 0..300);
        store.drain().expect("drain");
    }
    let stats = store.stats().expect("stats");
    assert!(stats.reclaimed > 0);
    assert_eq!(stats.appended_blocks, appended, "file grew despite reclaim");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_remove_after_drain() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..100);
    store.drain().expect("drain");

    remove_all(&store, 0..50);
    assert_eq!(keys(&store), (50..100).map(key).collect::<Vec<_>>());
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_remove_after_automatic_drain() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..20);
    assert!(store.stats().expect("stats").drains > 0);

    // The root leaf was last written by a drained changeset
    remove_all(&store, 0..5);
    assert_eq!(keys(&store), (5..20).map(key).collect::<Vec<_>>());
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_remove_after_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..60);
    store.close().expect("close");

    let store = Store::open(config).expect("reopen store");
    remove_all(&store, (0..60).step_by(2));
    assert_eq!(store.count().expect("count"), 30);
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_underfull_leaf_borrows_from_right_when_left_is_minimal() {
    let (store, _dir) = new_test_store().expect("create store");
    // Ascending inserts leave leaves of 8, 8, 8, 8 and 16 entries
    insert_all(&store, 0..48);
    assert_eq!(store.stats().expect("stats").levels, vec![1, 5]);

    // First leaf down to the threshold of 4, then the second one below it
    remove_all(&store, 0..4);
    remove_all(&store, 8..13);

    assert_eq!(store.stats().expect("stats").levels, vec![1, 5]);
    let expected: Vec<Vec<u8>> = (4..8).chain(13..48).map(key).collect();
    assert_eq!(keys(&store), expected);
    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_mass_removal_outgrows_free_list_record() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    // Room for 127 free offsets on disk
    let config = small_config(dir.path()).with_free_list_size(1024);
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..3000);
    store.drain().expect("drain");
    assert!(store.stats().expect("stats").levels.iter().sum::<usize>() > 127);

    remove_all(&store, 0..3000);
    store.drain().expect("drain");
    let stats = store.stats().expect("stats");
    assert_eq!(stats.levels, vec![1]);
    assert_eq!(
        stats.free_blocks as u64 + 1,
        stats.appended_blocks - stats.truncated_blocks
    );
    assert!(store.check().expect("check"));
    store.close().expect("close");

    let store = Store::open(config).expect("reopen store");
    assert_eq!(store.count().expect("count"), 0);
    assert!(store.check().expect("check after reopen"));
    insert_all(&store, 0..100);
    store.drain().expect("drain");
    assert!(store.check().expect("check after refill"));
    store.close().expect("close");
}
