//! Public store handle.
//!
//! Writers serialize on the writer lock: append the entry bytes to the log,
//! take a snapshot, build a changeset against its root, commit, release.
//! Readers take a snapshot and walk it without any lock.

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::registry::StoreRegistry;
use crate::storage::StoreError;
use crate::storage::btree::{self, Changeset, Cursor, NewEntry, SearchKey, insert, remove};
use crate::storage::kvlog::KvLog;
use crate::storage::mvcc::StoreStats;
use crate::storage::node::{BlockOffset, KeyEntry, LogOffset};
use crate::storage::shared::{Shared, Snapshot};

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Arc<[u8]>,
    pub docid: Arc<[u8]>,
    pub value: Arc<[u8]>,
}

/// Handle on an open store.
///
/// Handles obtained through the same [`StoreRegistry`] for the same index
/// file share one set of actors. Call [`Store::close`] when done; a handle
/// dropped without it is closed implicitly.
pub struct Store {
    shared: Arc<Shared>,
    registry: StoreRegistry,
    closed: bool,
}

impl Store {
    /// Create a new store with its own registry.
    pub fn create(config: StoreConfig) -> Result<Self, StoreError> {
        StoreRegistry::new().create(config)
    }

    /// Open an existing store with its own registry.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        StoreRegistry::new().open(config)
    }

    pub(crate) const fn from_parts(shared: Arc<Shared>, registry: StoreRegistry) -> Self {
        Self {
            shared,
            registry,
            closed: false,
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Insert an entry.
    ///
    /// # Panics
    ///
    /// Panics if `key` and `docid` are already present. Remove the old
    /// entry first.
    pub fn insert(&self, key: &[u8], docid: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.insert_with_control(key, docid, value, 0)
    }

    /// Insert an entry carrying `control` bits in its key entry.
    pub fn insert_with_control(
        &self,
        key: &[u8],
        docid: &[u8],
        value: &[u8],
        control: u32,
    ) -> Result<(), StoreError> {
        let shared = &*self.shared;
        let _writer = shared.lock_writer()?;
        let offsets = shared
            .kv
            .append_all(vec![key.to_vec(), docid.to_vec(), value.to_vec()])?;
        let new = NewEntry {
            key,
            docid,
            entry: KeyEntry::new(control, offsets[0], offsets[1]),
            value: offsets[2],
        };

        let snapshot = shared.snapshot();
        let mut cs = Changeset::new(shared);
        match insert::insert(&mut cs, snapshot.root().offset(), &new) {
            Ok(root) => commit(shared, snapshot, cs, root),
            Err(e) => {
                snapshot.release_with(Vec::new(), cs.abort());
                Err(e)
            }
        }
    }

    /// Remove the entry for `key` and `docid`. Returns whether it existed.
    pub fn remove(&self, key: &[u8], docid: &[u8]) -> Result<bool, StoreError> {
        let shared = &*self.shared;
        let _writer = shared.lock_writer()?;
        let snapshot = shared.snapshot();
        let Some(path) = remove::find_path(shared, snapshot.root(), key, docid)? else {
            return Ok(false);
        };

        let mut cs = Changeset::new(shared);
        match remove::remove(&mut cs, path) {
            Ok(root) => commit(shared, snapshot, cs, root).map(|()| true),
            Err(e) => {
                snapshot.release_with(Vec::new(), cs.abort());
                Err(e)
            }
        }
    }

    /// Values stored under `key`, in docid order.
    pub fn lookup(&self, key: &[u8]) -> Result<Scan<'_, Arc<[u8]>>, StoreError> {
        Scan::new(&self.shared, Some(key), |kv, _, value| kv.read(value))
    }

    /// Every key in ascending order, once per entry.
    pub fn key_set(&self) -> Result<Scan<'_, Arc<[u8]>>, StoreError> {
        Scan::new(&self.shared, None, |kv, entry, _| kv.read(entry.key_offset))
    }

    /// Every docid, in entry order.
    pub fn docid_set(&self) -> Result<Scan<'_, Arc<[u8]>>, StoreError> {
        Scan::new(&self.shared, None, |kv, entry, _| kv.read(entry.docid_offset))
    }

    /// Every value, in entry order.
    pub fn value_set(&self) -> Result<Scan<'_, Arc<[u8]>>, StoreError> {
        Scan::new(&self.shared, None, |kv, _, value| kv.read(value))
    }

    /// Every entry in (key, docid) order.
    pub fn full_set(&self) -> Result<Scan<'_, Entry>, StoreError> {
        Scan::new(&self.shared, None, read_entry)
    }

    /// The smallest entry.
    pub fn front(&self) -> Result<Option<Entry>, StoreError> {
        self.full_set()?.next().transpose()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let snapshot = self.shared.snapshot();
        btree::count(&self.shared, snapshot.root())
    }

    /// Whether any entry has `key`.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.lookup(key)?.next().transpose()?.is_some())
    }

    /// Whether the exact `key` and `docid` pair is stored.
    pub fn equals(&self, key: &[u8], docid: &[u8]) -> Result<bool, StoreError> {
        let snapshot = self.shared.snapshot();
        Ok(remove::find_path(&self.shared, snapshot.root(), key, docid)?.is_some())
    }

    /// Write every queued changeset and publish the newest root.
    pub fn drain(&self) -> Result<(), StoreError> {
        let _writer = self.shared.lock_writer()?;
        self.shared.mvcc.drain()
    }

    /// Audit the published tree and the block accounting. Violations are
    /// logged and reported as `Ok(false)`.
    pub fn check(&self) -> Result<bool, StoreError> {
        let _writer = self.shared.lock_writer()?;
        self.shared.mvcc.check()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.shared.mvcc.stats()
    }

    /// Release this handle. The last handle drains and stops the actors.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.registry.close(&self.shared, false)
    }

    /// Release this handle and delete both files once the last handle is
    /// closed.
    pub fn destroy(mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.registry.close(&self.shared, true)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.registry.close(&self.shared, false)
        {
            tracing::warn!(
                path = %self.shared.path.display(),
                error = %e,
                "implicit close of dropped store failed"
            );
        }
    }
}

/// Commit the session and end the write transaction.
fn commit(
    shared: &Shared,
    snapshot: Snapshot<'_>,
    cs: Changeset<'_>,
    root: BlockOffset,
) -> Result<(), StoreError> {
    let (mv, returned) = cs.finish(root);
    let stales = mv.stales.clone();
    // A failed auto-drain leaves the changeset queued; it is still ours to
    // release.
    let result = shared.mvcc.commit(mv).map(|_| ());
    snapshot.release_with(stales, returned);
    result
}

fn read_entry(kv: &KvLog, entry: KeyEntry, value: LogOffset) -> Result<Entry, StoreError> {
    Ok(Entry {
        key: kv.read(entry.key_offset)?,
        docid: kv.read(entry.docid_offset)?,
        value: kv.read(value)?,
    })
}

type Project<T> = fn(&KvLog, KeyEntry, LogOffset) -> Result<T, StoreError>;

/// Ordered scan over one snapshot. The snapshot stays pinned until the
/// scan is dropped.
pub struct Scan<'a, T> {
    shared: &'a Shared,
    cursor: Cursor<'a>,
    /// Only entries with this key; the scan ends at the first other key.
    key: Option<Vec<u8>>,
    project: Project<T>,
    done: bool,
    _snapshot: Snapshot<'a>,
}

impl<'a, T> Scan<'a, T> {
    fn new(shared: &'a Shared, key: Option<&[u8]>, project: Project<T>) -> Result<Self, StoreError> {
        let snapshot = shared.snapshot();
        let target = key.map(SearchKey::first_of);
        let cursor = Cursor::seek(shared, snapshot.root(), target.as_ref(), key.is_none())?;
        Ok(Self {
            shared,
            cursor,
            key: key.map(<[u8]>::to_vec),
            project,
            done: false,
            _snapshot: snapshot,
        })
    }

    fn advance(&mut self) -> Result<Option<T>, StoreError> {
        let Some((entry, value)) = self.cursor.next_entry()? else {
            return Ok(None);
        };
        if let Some(key) = &self.key
            && *self.shared.kv.read(entry.key_offset)? != **key
        {
            return Ok(None);
        }
        (self.project)(&self.shared.kv, entry, value).map(Some)
    }
}

impl<T> Iterator for Scan<'_, T> {
    type Item = Result<T, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.advance().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
