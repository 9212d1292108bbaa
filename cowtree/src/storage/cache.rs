//! Node cache owned by the MVCC actor.
//!
//! Internal nodes are few and hot, so they are kept without bound. Leaves
//! go through an LRU bounded by `max_leaf_cache_entries`.
//!
//! A drain never edits the cache in place: [`NodeCache::rebuild`] builds a
//! fresh structure holding the surviving entries plus the drained commits
//! and swaps it in as a whole.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::storage::node::{BlockOffset, Node};

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct NodeCache {
    interior: HashMap<BlockOffset, Arc<Node>>,
    leaves: Option<LruCache<BlockOffset, Arc<Node>>>,
    enabled: bool,
    stats: CacheStats,
}

impl NodeCache {
    /// A cache bounded to `max_leaves` leaves. With `enabled == false`
    /// nothing is ever stored.
    #[must_use]
    pub fn new(max_leaves: usize, enabled: bool) -> Self {
        Self {
            interior: HashMap::new(),
            leaves: NonZeroUsize::new(max_leaves).map(LruCache::new),
            enabled,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, offset: BlockOffset) -> Option<Arc<Node>> {
        let found = match self.interior.get(&offset) {
            Some(node) => Some(Arc::clone(node)),
            None => self
                .leaves
                .as_mut()
                .and_then(|leaves| leaves.get(&offset))
                .map(Arc::clone),
        };
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, node: Arc<Node>) {
        if !self.enabled {
            return;
        }
        let offset = node.offset();
        if !node.is_leaf() {
            if let Some(leaves) = self.leaves.as_mut() {
                let _ = leaves.pop(&offset);
            }
            self.interior.insert(offset, node);
            return;
        }
        self.interior.remove(&offset);
        if let Some(leaves) = self.leaves.as_mut()
            && let Some((evicted, _)) = leaves.push(offset, node)
            && evicted != offset
        {
            self.stats.evictions += 1;
        }
    }

    /// Drop the entry for a reclaimed offset.
    pub fn evict(&mut self, offset: BlockOffset) {
        if self.interior.remove(&offset).is_none() {
            if let Some(leaves) = self.leaves.as_mut() {
                let _ = leaves.pop(&offset);
            }
        }
    }

    /// Replace the cache with one that holds every surviving entry not in
    /// `stales`, followed by `commits`. Leaf recency order is preserved.
    pub fn rebuild(&mut self, commits: impl IntoIterator<Item = Arc<Node>>, stales: &HashSet<BlockOffset>) {
        let capacity = self.leaves.as_ref().map(LruCache::cap);
        let mut next = Self {
            interior: HashMap::with_capacity(self.interior.len()),
            leaves: capacity.map(LruCache::new),
            enabled: self.enabled,
            stats: self.stats,
        };

        for (offset, node) in self.interior.drain() {
            if !stales.contains(&offset) {
                next.interior.insert(offset, node);
            }
        }
        if let Some(leaves) = self.leaves.as_mut() {
            while let Some((offset, node)) = leaves.pop_lru() {
                if !stales.contains(&offset) {
                    next.insert(node);
                }
            }
        }
        for node in commits {
            next.insert(node);
        }

        *self = next;
    }

    #[must_use]
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of cached nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interior.len() + self.leaves.as_ref().map_or(0, LruCache::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
