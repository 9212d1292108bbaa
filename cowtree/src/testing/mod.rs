use std::path::Path;
use std::sync::Once;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::config::StoreConfig;
use crate::storage::{Store, StoreError};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Small blocks (16 keys per node) so that a few dozen entries already
/// build a multi-level tree.
#[must_use]
pub fn small_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir.join("test.idx"), dir.join("test.kv"))
        .with_block_size(512)
        .with_drain_rate(8)
        .with_max_leaf_cache_entries(64)
}

/// Create a store in a fresh temporary directory.
///
/// The directory is removed when the returned guard is dropped; close the
/// store first.
pub fn new_test_store() -> Result<(Store, TempDir), StoreError> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(small_config(dir.path()))?;
    Ok((store, dir))
}

/// Fixed-width key so that byte order matches numeric order.
#[must_use]
pub fn key(n: u32) -> Vec<u8> {
    format!("key{n:08}").into_bytes()
}

#[must_use]
pub fn docid(n: u32) -> Vec<u8> {
    format!("doc{n:08}").into_bytes()
}

#[must_use]
pub fn value(n: u32) -> Vec<u8> {
    format!("value-{n}").into_bytes()
}
