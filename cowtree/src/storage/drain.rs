//! Drain pipeline.
//!
//! Committed changesets ([`Mv`]) queue up in the MVCC actor until the queue
//! exceeds `drain_rate` or a caller forces a drain. A drain takes the
//! oldest changesets, writes their nodes, then persists free list and head
//! with the dual-copy discipline. Only after the head is on disk do the
//! drained nodes leave the pending set and enter the node cache.
//!
//! # Ordering
//!
//! 1. Sync the key/value log when `sync` is set
//! 2. Write every commit that is not recycled
//! 3. Flush free list, then head (carrying the free-list checksum)
//! 4. Publish the new timestamp, swap in the rebuilt cache and the clean
//!    copy of the current root
//! 5. Return reclaimable offsets to the free list
//!
//! When the free list outgrows its on-disk record, free blocks at the end
//! of the file are cut off after the head is written.
//!
//! Offsets reclaimed in step 5 reach disk with the next flush, so the
//! durable free list never names a block the durable head can reach.

use std::collections::HashSet;
use std::sync::Arc;

use crate::storage::StoreError;
use crate::storage::mvcc::{Epoch, WriteState};
use crate::storage::node::{BlockOffset, Node};

/// An offset superseded by a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stale {
    pub offset: BlockOffset,
    /// The superseded node was itself created by an undrained changeset.
    pub dirty: bool,
}

/// One logical mutation: the new node versions and the offsets they
/// replace. Applied as a unit.
#[derive(Debug, Clone)]
pub struct Mv {
    /// Assigned by the actor on commit.
    pub timestamp: Epoch,
    pub root: BlockOffset,
    pub commits: Vec<Arc<Node>>,
    pub stales: Vec<Stale>,
}

impl WriteState {
    /// Drain changesets committed before `limit`, or every changeset when
    /// there is no limit.
    pub(crate) fn drain_until(&mut self, limit: Option<Epoch>) -> Result<(), StoreError> {
        let count = self
            .queue
            .iter()
            .take_while(|mv| limit.is_none_or(|limit| mv.timestamp < limit))
            .count();
        if count == 0 {
            return Ok(());
        }

        let oldest = self.epochs.first().copied();
        let mut stales = HashSet::new();
        let mut recycled = HashSet::new();
        for mv in self.queue.range(..count) {
            for stale in &mv.stales {
                stales.insert(stale.offset);
                if stale.dirty
                    && self.pending.contains_key(&stale.offset)
                    && oldest.is_none_or(|epoch| mv.timestamp < epoch)
                {
                    recycled.insert(stale.offset);
                }
            }
        }

        if self.sync {
            self.kv.sync()?;
        }
        let mut written = 0u64;
        for mv in self.queue.range(..count) {
            for node in &mv.commits {
                if !recycled.contains(&node.offset()) {
                    self.file.write_node(node)?;
                    written += 1;
                }
            }
        }
        if self.sync {
            self.file.sync()?;
        }

        let last = &self.queue[count - 1];
        self.head.root = last.root;
        self.head.timestamp = last.timestamp;
        self.head_dirty = true;
        self.flush_meta()?;

        let batch: Vec<_> = self.queue.drain(..count).collect();
        let mut clean = Vec::new();
        for node in batch.iter().flat_map(|mv| &mv.commits) {
            self.pending.remove(&node.offset());
            if !stales.contains(&node.offset()) {
                let mut copy = Node::clone(node);
                copy.set_dirty(false);
                clean.push(Arc::new(copy));
            }
        }
        if let Some(root) = clean.iter().find(|node| node.offset() == self.root.offset()) {
            self.root = Arc::clone(root);
        }
        self.cache.rebuild(clean, &stales);

        self.stats.drains += 1;
        self.stats.nodes_flushed += written;
        self.stats.recycled += recycled.len() as u64;
        let reclaimed = self.stats.reclaimed;
        self.reclaim();
        tracing::debug!(
            batch = count,
            written,
            recycled = recycled.len(),
            reclaimed = self.stats.reclaimed - reclaimed,
            timestamp = self.published,
            "drained changesets"
        );
        Ok(())
    }

    /// Drain every queued changeset, then persist whatever the final
    /// reclaim pass changed.
    pub(crate) fn drain_all(&mut self) -> Result<(), StoreError> {
        self.drain_until(None)?;
        self.reclaim();
        if self.freelist.is_dirty() || self.head_dirty {
            self.flush_meta()?;
        }
        Ok(())
    }

    /// Flush free list then head, and advance the published timestamp.
    fn flush_meta(&mut self) -> Result<(), StoreError> {
        let end = self.trim_tail();
        self.head.partial_freelist = self.freelist.is_partial();
        self.head.freelist_crc = self.freelist.flush(&self.file)?;
        self.stats.freelist_flushes += 1;
        self.head.flush(&self.file)?;
        if self.sync {
            self.file.sync()?;
        }
        self.stats.head_flushes += 1;
        self.head_dirty = false;
        self.published = self.head.timestamp;

        if let Some(end) = end {
            let blocks = (self.file.len() - end) / self.layout.block_size;
            self.file.truncate(end)?;
            self.stats.truncated_blocks += blocks;
            tracing::debug!(blocks, len = end, "truncated free blocks at end of file");
        }
        Ok(())
    }

    /// With more free offsets than the record holds, drop the run of free
    /// blocks at the end of the file from the list. Returns the new file
    /// length.
    fn trim_tail(&mut self) -> Option<u64> {
        if !self.freelist.is_partial() {
            return None;
        }
        let free: HashSet<BlockOffset> = self.freelist.iter().collect();
        let block_size = self.layout.block_size;
        let len = self.file.len();
        let mut end = len;
        while end > self.layout.first_block_offset && free.contains(&(end - block_size)) {
            end -= block_size;
        }
        if end == len {
            return None;
        }
        self.freelist.truncate_at(end);
        Some(end)
    }
}
