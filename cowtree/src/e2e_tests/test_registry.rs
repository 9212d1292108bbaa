//! Handle sharing and lifecycle through `StoreRegistry`.

use crate::e2e_tests::helpers::*;
use crate::registry::StoreRegistry;
use crate::storage::StoreError;
use crate::testing::init_tracing;

#[test]
fn test_handles_share_one_tree() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let registry = StoreRegistry::new();

    let first = registry.create(config.clone()).expect("create store");
    let second = registry.open(config.clone()).expect("open shared handle");
    assert_eq!(registry.open_count(&config.index_file), 2);

    insert_all(&first, 0..30);
    assert_eq!(second.count().expect("count"), 30);
    remove_all(&second, 0..10);
    assert_eq!(keys(&first), (10..30).map(key).collect::<Vec<_>>());

    first.close().expect("close first");
    assert_eq!(registry.open_count(&config.index_file), 1);
    insert_all(&second, 100..105);
    second.close().expect("close second");
    assert_eq!(registry.open_count(&config.index_file), 0);

    let reopened = registry.open(config).expect("reopen");
    assert_eq!(reopened.count().expect("count"), 25);
    reopened.close().expect("close");
}

#[test]
fn test_create_of_open_store_fails() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let registry = StoreRegistry::new();

    let store = registry.create(config.clone()).expect("create store");
    assert!(matches!(
        registry.create(config),
        Err(StoreError::AlreadyExists(_))
    ));
    store.close().expect("close");
}

#[test]
fn test_dropped_handle_is_closed() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let registry = StoreRegistry::new();

    {
        let store = registry.create(config.clone()).expect("create store");
        insert_all(&store, 0..20);
    }
    assert_eq!(registry.open_count(&config.index_file), 0);

    let store = registry.open(config).expect("reopen");
    assert_eq!(store.count().expect("count"), 20);
    store.close().expect("close");
}

#[test]
fn test_destroy_waits_for_last_handle() {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = small_config(dir.path());
    let registry = StoreRegistry::new();

    let first = registry.create(config.clone()).expect("create store");
    let second = registry.open(config.clone()).expect("open shared handle");
    insert_all(&first, 0..10);

    first.destroy().expect("destroy first handle");
    assert!(config.index_file.exists());
    assert_eq!(second.count().expect("count"), 10);

    second.close().expect("close last handle");
    assert!(!config.index_file.exists());
    assert!(!config.kv_file.exists());
}
