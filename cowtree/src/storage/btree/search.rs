//! Key search within a node.
//!
//! Entries are ordered by key bytes, then docid bytes. Both live in the
//! key/value log, so every comparison may read the log.

use std::cmp::Ordering;

use crate::storage::StoreError;
use crate::storage::kvlog::KvLog;
use crate::storage::node::KeyEntry;

/// Width under which the binary search switches to a linear scan.
const LINEAR_WINDOW: usize = 4;

/// A search target. Without a docid the target sorts before every entry
/// carrying the same key bytes.
#[derive(Debug, Clone, Copy)]
pub struct SearchKey<'a> {
    pub key: &'a [u8],
    pub docid: Option<&'a [u8]>,
}

impl<'a> SearchKey<'a> {
    #[must_use]
    pub const fn exact(key: &'a [u8], docid: &'a [u8]) -> Self {
        Self {
            key,
            docid: Some(docid),
        }
    }

    #[must_use]
    pub const fn first_of(key: &'a [u8]) -> Self {
        Self { key, docid: None }
    }
}

/// Outcome of [`search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Index of the first entry not smaller than the target.
    pub index: usize,
    /// The entry at `index` has the target's key bytes.
    pub key_matched: bool,
    /// The entry at `index` has the target's key and docid bytes.
    pub exact: bool,
}

impl SearchResult {
    /// Child to descend into from an internal node. Separators equal to the
    /// target route right.
    #[must_use]
    pub const fn child_index(&self) -> usize {
        if self.exact { self.index + 1 } else { self.index }
    }
}

/// Locate `target` among `keys`.
pub fn search(kv: &KvLog, keys: &[KeyEntry], target: &SearchKey<'_>) -> Result<SearchResult, StoreError> {
    let mut lo = 0;
    let mut hi = keys.len();
    while hi - lo > LINEAR_WINDOW {
        let mid = lo + (hi - lo) / 2;
        if compare_target(kv, target, &keys[mid])? == Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    let mut index = hi;
    for (i, entry) in keys.iter().enumerate().take(hi).skip(lo) {
        if compare_target(kv, target, entry)? != Ordering::Greater {
            index = i;
            break;
        }
    }

    let Some(entry) = keys.get(index) else {
        return Ok(SearchResult {
            index,
            key_matched: false,
            exact: false,
        });
    };
    let key_matched = *kv.read(entry.key_offset)? == *target.key;
    let exact = match target.docid {
        Some(docid) if key_matched => *kv.read(entry.docid_offset)? == *docid,
        _ => false,
    };
    Ok(SearchResult {
        index,
        key_matched,
        exact,
    })
}

/// Order of `target` relative to `entry`.
pub fn compare_target(kv: &KvLog, target: &SearchKey<'_>, entry: &KeyEntry) -> Result<Ordering, StoreError> {
    let key = kv.read(entry.key_offset)?;
    match Ord::cmp(target.key, &*key) {
        Ordering::Equal => match target.docid {
            None => Ok(Ordering::Less),
            Some(docid) => Ok(Ord::cmp(docid, &*kv.read(entry.docid_offset)?)),
        },
        order => Ok(order),
    }
}

/// Order of two stored entries.
pub fn compare_entries(kv: &KvLog, a: &KeyEntry, b: &KeyEntry) -> Result<Ordering, StoreError> {
    let key = kv.read(a.key_offset)?;
    let docid = kv.read(a.docid_offset)?;
    compare_target(kv, &SearchKey::exact(&key, &docid), b)
}
