//! Registry of open stores, keyed by canonical index-file path.
//!
//! Every [`Store`] opened through the same registry for the same file shares
//! one [`Shared`] state, so a single pair of actors owns the files no matter
//! how many handles exist.
//!
//! # Lifecycle
//!
//! - `create` registers a new entry with one handle
//! - `open` returns another handle on a registered entry, or opens the files
//! - closing a handle decrements the count; the last close removes the
//!   entry, drains and stops the actors, and deletes the files if any handle
//!   asked to destroy the store
//!
//! # Invariants
//!
//! - At most one `Shared` per canonical path per registry
//! - An entry's handle count equals the number of live `Store` handles on it

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::storage::shared::{Shared, canonical_path};
use crate::storage::{Store, StoreError};

struct Entry {
    shared: Arc<Shared>,
    handles: AtomicUsize,
    destroy: AtomicBool,
}

/// Registry of open stores. Cloning yields another reference to the same
/// registry.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<RwLock<HashMap<PathBuf, Entry>>>,
}

impl StoreRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store and register it.
    #[allow(clippy::significant_drop_tightening)] // the write lock must cover creation
    pub fn create(&self, config: StoreConfig) -> Result<Store, StoreError> {
        let path = canonical_path(&config.index_file);
        let mut stores = self.stores.write().map_err(|_| StoreError::LockPoisoned)?;
        if stores.contains_key(&path) {
            return Err(StoreError::AlreadyExists(config.index_file));
        }
        let shared = Arc::new(Shared::create(config)?);
        stores.insert(
            path,
            Entry {
                shared: Arc::clone(&shared),
                handles: AtomicUsize::new(1),
                destroy: AtomicBool::new(false),
            },
        );
        Ok(Store::from_parts(shared, self.clone()))
    }

    /// Open a store, sharing the registered state if it is already open.
    /// The configuration of the first opener stays in effect.
    #[allow(clippy::significant_drop_tightening)] // the write lock must cover opening
    pub fn open(&self, config: StoreConfig) -> Result<Store, StoreError> {
        let path = canonical_path(&config.index_file);

        // Fast path: already open (read lock only)
        {
            let stores = self.stores.read().map_err(|_| StoreError::LockPoisoned)?;
            if let Some(entry) = stores.get(&path) {
                entry.handles.fetch_add(1, Ordering::SeqCst);
                return Ok(Store::from_parts(Arc::clone(&entry.shared), self.clone()));
            }
        }

        let mut stores = self.stores.write().map_err(|_| StoreError::LockPoisoned)?;
        // Another thread may have opened it while we waited for the write lock
        if let Some(entry) = stores.get(&path) {
            entry.handles.fetch_add(1, Ordering::SeqCst);
            return Ok(Store::from_parts(Arc::clone(&entry.shared), self.clone()));
        }
        let shared = Arc::new(Shared::open(config)?);
        stores.insert(
            path,
            Entry {
                shared: Arc::clone(&shared),
                handles: AtomicUsize::new(1),
                destroy: AtomicBool::new(false),
            },
        );
        Ok(Store::from_parts(shared, self.clone()))
    }

    /// Number of live handles on the store at `path`.
    #[must_use]
    pub fn open_count(&self, path: &Path) -> usize {
        let path = canonical_path(path);
        self.stores
            .read()
            .map_or(0, |stores| stores.get(&path).map_or(0, |entry| entry.handles.load(Ordering::SeqCst)))
    }

    /// Release one handle on `shared`.
    pub(crate) fn close(&self, shared: &Arc<Shared>, destroy: bool) -> Result<(), StoreError> {
        let mut stores = self.stores.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(entry) = stores.get(&shared.path) else {
            tracing::error!(path = %shared.path.display(), "close of unregistered store");
            panic!("store {} is not registered", shared.path.display());
        };
        if destroy {
            entry.destroy.store(true, Ordering::SeqCst);
        }
        if entry.handles.fetch_sub(1, Ordering::SeqCst) > 1 {
            return Ok(());
        }

        let Some(entry) = stores.remove(&shared.path) else {
            return Ok(());
        };
        let result = entry.shared.shutdown();
        drop(stores);

        if entry.destroy.load(Ordering::SeqCst) {
            std::fs::remove_file(&entry.shared.config.index_file)?;
            std::fs::remove_file(&entry.shared.config.kv_file)?;
            tracing::info!(path = %entry.shared.path.display(), "destroyed store");
        } else {
            tracing::info!(path = %entry.shared.path.display(), "closed store");
        }
        result
    }
}
