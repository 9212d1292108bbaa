//! State shared by every handle on one pair of store files.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::{Layout, StoreConfig};
use crate::storage::StoreError;
use crate::storage::drain::Stale;
use crate::storage::file::IndexFile;
use crate::storage::kvlog::KvLog;
use crate::storage::mvcc::{Epoch, Mvcc, WriteState};
use crate::storage::node::{BlockOffset, Node};

pub struct Shared {
    pub(crate) config: StoreConfig,
    pub(crate) layout: Layout,
    /// Canonical path of the index file.
    pub(crate) path: PathBuf,
    pub(crate) file: Arc<IndexFile>,
    pub(crate) kv: KvLog,
    pub(crate) mvcc: Mvcc,
    /// Held by whoever builds a changeset.
    writer: Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Create both files and start the actors.
    pub(crate) fn create(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        for path in [&config.index_file, &config.kv_file] {
            if path.exists() {
                return Err(StoreError::AlreadyExists(path.clone()));
            }
        }
        let layout = config.layout();
        let file = Arc::new(IndexFile::create(&config.index_file, layout)?);
        let (kv, kv_thread) = KvLog::create(&config.kv_file, kv_cache_entries(&config))?;
        let state = match WriteState::create(Arc::clone(&file), kv.clone(), &config) {
            Ok(state) => state,
            Err(e) => {
                stop_log(&kv, kv_thread);
                return Err(e);
            }
        };
        tracing::info!(
            index = %config.index_file.display(),
            block_size = layout.block_size,
            max_keys = layout.max_keys,
            "created store"
        );
        Self::start(config, layout, file, kv, kv_thread, state)
    }

    /// Open existing files and start the actors.
    pub(crate) fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let layout = config.layout();
        let file = Arc::new(IndexFile::open(&config.index_file, layout)?);
        let (kv, kv_thread) = KvLog::open(&config.kv_file, kv_cache_entries(&config))?;
        let state = match WriteState::open(Arc::clone(&file), kv.clone(), &config) {
            Ok(state) => state,
            Err(e) => {
                stop_log(&kv, kv_thread);
                return Err(e);
            }
        };
        tracing::info!(
            index = %config.index_file.display(),
            root = state.head.root,
            timestamp = state.head.timestamp,
            "opened store"
        );
        Self::start(config, layout, file, kv, kv_thread, state)
    }

    fn start(
        config: StoreConfig,
        layout: Layout,
        file: Arc<IndexFile>,
        kv: KvLog,
        kv_thread: JoinHandle<()>,
        state: WriteState,
    ) -> Result<Self, StoreError> {
        let (mvcc, mvcc_thread) = match Mvcc::spawn(state) {
            Ok(spawned) => spawned,
            Err(e) => {
                stop_log(&kv, kv_thread);
                return Err(e);
            }
        };
        let path = canonical_path(&config.index_file);
        Ok(Self {
            config,
            layout,
            path,
            file,
            kv,
            mvcc,
            writer: Mutex::new(()),
            threads: Mutex::new(vec![mvcc_thread, kv_thread]),
        })
    }

    /// Node at `offset`, through the actor's pending set and cache.
    pub(crate) fn fetch(&self, offset: BlockOffset) -> Result<Arc<Node>, StoreError> {
        if let Some(node) = self.mvcc.cache_lookup(offset) {
            return Ok(node);
        }
        let node = Arc::new(self.file.read_node(offset)?);
        self.mvcc.cache_insert(Arc::clone(&node));
        Ok(node)
    }

    /// Begin a read or write transaction.
    pub(crate) fn snapshot(&self) -> Snapshot<'_> {
        let (epoch, root) = self.mvcc.access();
        Snapshot {
            shared: self,
            epoch,
            root,
            released: false,
        }
    }

    pub(crate) fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Drain, stop both actors and wait for their threads.
    pub(crate) fn shutdown(&self) -> Result<(), StoreError> {
        let _writer = self.lock_writer()?;
        let result = self.mvcc.shutdown();
        let log = self.kv.shutdown();
        let threads: Vec<_> = self
            .threads
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .drain(..)
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!(path = %self.path.display(), "store actor panicked");
            }
        }
        result.and(log)
    }
}

/// A consistent view of the tree, pinned by an epoch until dropped.
pub struct Snapshot<'a> {
    shared: &'a Shared,
    epoch: Epoch,
    root: Arc<Node>,
    released: bool,
}

impl Snapshot<'_> {
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    /// End a write transaction, handing over the offsets it superseded and
    /// those it popped without using.
    pub(crate) fn release_with(mut self, stales: Vec<Stale>, returned: Vec<BlockOffset>) {
        self.released = true;
        self.shared.mvcc.release(self.epoch, stales, returned);
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.shared.mvcc.try_release(self.epoch);
        }
    }
}

const fn kv_cache_entries(config: &StoreConfig) -> usize {
    if config.no_cache { 0 } else { config.max_kv_cache_entries }
}

fn stop_log(kv: &KvLog, thread: JoinHandle<()>) {
    if let Err(e) = kv.shutdown() {
        tracing::warn!(error = %e, "failed to stop key/value log");
    }
    if thread.join().is_err() {
        tracing::error!("key/value log actor panicked");
    }
}

/// Registry key for an index file, which need not exist yet.
pub(crate) fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    parent
        .canonicalize()
        .map_or_else(|_| path.to_path_buf(), |parent| parent.join(name))
}
