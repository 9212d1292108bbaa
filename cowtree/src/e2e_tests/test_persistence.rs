//! Durability across close and reopen, and rejection of damaged files.

use crate::e2e_tests::helpers::*;
use crate::storage::{Store, StoreError};
use crate::testing::init_tracing;

#[test]
fn test_entries_survive_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());

    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..150);
    remove_all(&store, (0..150).filter(|n| n % 3 == 0));
    store.close().expect("close");

    let store = Store::open(config.clone()).expect("reopen store");
    let expected: Vec<Vec<u8>> = (0..150).filter(|n| n % 3 != 0).map(key).collect();
    assert_eq!(keys(&store), expected);
    assert!(store.check().expect("check after reopen"));
    assert_eq!(
        collect(store.lookup(&key(7))).first().map(|v| v.to_vec()),
        Some(value(7))
    );

    insert_all(&store, (0..150).filter(|n| n % 3 == 0));
    store.close().expect("close again");

    let store = Store::open(config).expect("reopen store again");
    assert_eq!(store.count().expect("count"), 150);
    assert!(store.check().expect("check"));
    store.close().expect("final close");
}

#[test]
fn test_create_refuses_existing_files() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    Store::create(config.clone())
        .expect("create store")
        .close()
        .expect("close");

    assert!(matches!(
        Store::create(config),
        Err(StoreError::AlreadyExists(_))
    ));
}

#[test]
fn test_open_with_other_block_size_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..20);
    store.close().expect("close");

    let result = Store::open(config.with_block_size(1024));
    assert!(matches!(
        result,
        Err(StoreError::ConfigMismatch {
            field: "block_size",
            stored: 512,
            configured: 1024
        })
    ));
}

#[test]
fn test_diverged_head_copies_refuse_to_open() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..20);
    store.close().expect("close");

    let mut bytes = std::fs::read(&config.index_file).expect("read index file");
    bytes[20] ^= 0xff;
    std::fs::write(&config.index_file, &bytes).expect("write index file");

    assert!(matches!(Store::open(config), Err(StoreError::Corrupted(_))));
}

#[test]
fn test_free_list_not_matching_head_refuses_to_open() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let store = Store::create(config.clone()).expect("create store");
    insert_all(&store, 0..20);
    store.close().expect("close");

    // Same change to both copies: only the head checksum can catch it
    let layout = config.layout();
    let mut bytes = std::fs::read(&config.index_file).expect("read index file");
    for copy in [layout.freelist_copy1_offset(), layout.freelist_copy2_offset()] {
        // swap the first two free offsets
        let pos = usize::try_from(copy).expect("offset fits") + 8;
        let first = bytes[pos..pos + 8].to_vec();
        bytes.copy_within(pos + 8..pos + 16, pos);
        bytes[pos + 8..pos + 16].copy_from_slice(&first);
    }
    std::fs::write(&config.index_file, &bytes).expect("write index file");

    assert!(matches!(Store::open(config), Err(StoreError::Corrupted(_))));
}

#[test]
fn test_second_independent_open_is_refused() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let first = Store::create(config.clone()).expect("create store");
    insert_all(&first, 0..50);

    assert!(matches!(
        Store::open(config.clone()),
        Err(StoreError::Locked(_))
    ));
    insert_all(&first, 50..100);
    first.close().expect("close");

    let second = Store::open(config).expect("open after close");
    assert_eq!(second.count().expect("count"), 100);
    assert!(second.check().expect("check"));
    second.close().expect("close");
}
