//! Common helpers for end-to-end tests.

use crate::storage::{Scan, Store, StoreError};
pub use crate::testing::{docid, key, new_test_store, small_config, value};

/// Drain a scan into a vector.
#[allow(clippy::expect_used)]
pub fn collect<T>(scan: Result<Scan<'_, T>, StoreError>) -> Vec<T> {
    scan.expect("open scan")
        .collect::<Result<Vec<_>, _>>()
        .expect("read scan")
}

/// Every key, as owned bytes.
pub fn keys(store: &Store) -> Vec<Vec<u8>> {
    collect(store.key_set()).into_iter().map(|key| key.to_vec()).collect()
}

/// Insert `key(n)`, `docid(n)`, `value(n)` for each `n`.
#[allow(clippy::expect_used)]
pub fn insert_all(store: &Store, ns: impl IntoIterator<Item = u32>) {
    for n in ns {
        store
            .insert(&key(n), &docid(n), &value(n))
            .expect("insert entry");
    }
}

/// Remove `key(n)`, `docid(n)` for each `n`, asserting each was present.
#[allow(clippy::expect_used)]
pub fn remove_all(store: &Store, ns: impl IntoIterator<Item = u32>) {
    for n in ns {
        assert!(store.remove(&key(n), &docid(n)).expect("remove entry"), "entry {n} missing");
    }
}
