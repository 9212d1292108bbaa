//! Drain triggering, recycling and statistics.

use crate::e2e_tests::helpers::*;
use crate::storage::Store;
use crate::testing::init_tracing;

#[test]
fn test_queue_drains_at_drain_rate() {
    let (store, _dir) = new_test_store().expect("create store");
    let rate = store.config().drain_rate;

    insert_all(&store, 0..u32::try_from(rate).expect("small rate"));
    let stats = store.stats().expect("stats");
    assert_eq!(stats.drains, 0);
    assert_eq!(stats.queued_mvs, rate);

    insert_all(&store, 100..101);
    let stats = store.stats().expect("stats");
    assert_eq!(stats.drains, 1);
    assert!(stats.queued_mvs <= 1);
    assert_eq!(stats.max_queued_mvs, rate + 1);

    store.drain().expect("drain");
    let stats = store.stats().expect("stats");
    assert_eq!(stats.queued_mvs, 0);
    assert_eq!(stats.pending_nodes, 0);
    store.close().expect("close");
}

#[test]
fn test_superseded_nodes_are_recycled_without_readers() {
    let (store, _dir) = new_test_store().expect("create store");
    // Every insert rewrites the same root leaf
    insert_all(&store, 0..5);
    store.drain().expect("drain");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.recycled, 4);
    assert_eq!(stats.nodes_flushed, 1);
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_pinned_reader_prevents_recycling() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..1);
    let scan = store.key_set().expect("pin a snapshot");
    insert_all(&store, 1..5);
    store.drain().expect("drain");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.recycled, 0);
    assert_eq!(stats.nodes_flushed, 5);
    assert_eq!(scan.count(), 1);

    store.drain().expect("drain");
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_stats_after_growth() {
    let (store, _dir) = new_test_store().expect("create store");
    insert_all(&store, 0..200);
    let _ = collect(store.full_set());
    store.drain().expect("drain");

    let stats = store.stats().expect("stats");
    assert!(stats.levels.len() >= 2);
    assert_eq!(stats.levels[0], 1);
    assert!(stats.freelist_pops > 200);
    assert!(stats.head_flushes >= stats.drains);
    assert!(stats.kv.appends >= 600);
    assert!(stats.kv.prefetched > 0);
    assert!(stats.cache.hits > 0);
    assert_eq!(stats.active_epochs, 0);
    assert_eq!(stats.free_blocks + stats.levels.iter().sum::<usize>(), total_blocks(&store));
    store.close().expect("close");
}

#[test]
fn test_uncached_store_reads_from_disk() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::create(small_config(dir.path()).with_no_cache(true)).expect("create store");
    insert_all(&store, 0..100);
    store.drain().expect("drain");

    assert_eq!(keys(&store), (0..100).map(key).collect::<Vec<_>>());
    remove_all(&store, 0..40);
    store.drain().expect("drain");
    assert_eq!(keys(&store), (40..100).map(key).collect::<Vec<_>>());

    let stats = store.stats().expect("stats");
    assert_eq!(stats.cached_nodes, 0);
    assert_eq!(stats.kv.cache_hits, 0);
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

#[test]
fn test_synced_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path()).with_sync(true);
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..50);
    store.drain().expect("drain");
    remove_all(&store, 0..10);
    store.close().expect("close");

    let store = Store::open(config).expect("reopen store");
    assert_eq!(keys(&store), (10..50).map(key).collect::<Vec<_>>());
    assert!(store.check().expect("check"));
    store.close().expect("close");
}

fn total_blocks(store: &Store) -> usize {
    let stats = store.stats().expect("stats");
    usize::try_from(stats.appended_blocks).expect("block count fits")
}
