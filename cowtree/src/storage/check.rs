//! Consistency audit, run inside the MVCC actor.
//!
//! Walks the tree under the published head and verifies:
//!
//! - keys in every node are strictly ascending and inside the bounds set
//!   by the separators above
//! - internal nodes have one more child than keys, leaves one value per key
//! - every non-root node holds between the rebalance threshold and
//!   `max_keys` keys, and all leaves sit at the same depth
//! - reachable blocks, free blocks and blocks in limbo (pending commits,
//!   queued reclaims, stales of undrained changesets) partition the block
//!   pool without overlap and without gaps
//!
//! Violations are logged at `warn` and reported as `Ok(false)`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::storage::StoreError;
use crate::storage::btree::search::compare_entries;
use crate::storage::mvcc::WriteState;
use crate::storage::node::{BlockOffset, KeyEntry, Node};

struct Walk {
    reachable: HashSet<BlockOffset>,
    leaf_depth: Option<usize>,
}

impl WriteState {
    pub(crate) fn check(&mut self) -> Result<bool, StoreError> {
        let root = self.fetch(self.head.root)?;
        let mut walk = Walk {
            reachable: HashSet::new(),
            leaf_depth: None,
        };
        let tree_ok = self.check_node(&root, None, None, 0, &mut walk)?;
        let blocks_ok = self.check_blocks(&walk.reachable);
        Ok(tree_ok && blocks_ok)
    }

    fn check_node(
        &mut self,
        node: &Arc<Node>,
        lower: Option<KeyEntry>,
        upper: Option<KeyEntry>,
        depth: usize,
        walk: &mut Walk,
    ) -> Result<bool, StoreError> {
        let offset = node.offset();
        if !walk.reachable.insert(offset) {
            tracing::warn!(offset, "node reachable twice");
            return Ok(false);
        }

        let keys = node.keys();
        let max_keys = self.layout.max_keys;
        let threshold = self.layout.rebalance_threshold;
        if keys.len() > max_keys || (depth > 0 && keys.len() < threshold) {
            tracing::warn!(offset, len = keys.len(), max_keys, threshold, "node occupancy out of range");
            return Ok(false);
        }
        for pair in keys.windows(2) {
            if compare_entries(&self.kv, &pair[0], &pair[1])? != Ordering::Less {
                tracing::warn!(offset, "keys out of order");
                return Ok(false);
            }
        }
        if let (Some(lower), Some(first)) = (lower, keys.first())
            && compare_entries(&self.kv, &lower, first)? == Ordering::Greater
        {
            tracing::warn!(offset, "key below its separator");
            return Ok(false);
        }
        if let (Some(upper), Some(last)) = (upper, keys.last())
            && compare_entries(&self.kv, last, &upper)? != Ordering::Less
        {
            tracing::warn!(offset, "key not below the next separator");
            return Ok(false);
        }

        match &**node {
            Node::Leaf(leaf) => {
                if leaf.values.len() != leaf.keys.len() {
                    tracing::warn!(offset, "leaf value count differs from key count");
                    return Ok(false);
                }
                match walk.leaf_depth {
                    Some(expected) if expected != depth => {
                        tracing::warn!(offset, depth, expected, "leaves at different depths");
                        return Ok(false);
                    }
                    _ => walk.leaf_depth = Some(depth),
                }
                Ok(true)
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    tracing::warn!(offset, "child count is not key count plus one");
                    return Ok(false);
                }
                for (i, child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(internal.keys[i - 1]) };
                    let child_upper = internal.keys.get(i).copied().or(upper);
                    let child = self.fetch(*child)?;
                    if !self.check_node(&child, child_lower, child_upper, depth + 1, walk)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn check_blocks(&self, reachable: &HashSet<BlockOffset>) -> bool {
        let all: HashSet<BlockOffset> = self.file.block_offsets().collect();
        let free: Vec<BlockOffset> = self.freelist.iter().collect();
        let free_set: HashSet<BlockOffset> = free.iter().copied().collect();
        if free_set.len() != free.len() {
            tracing::warn!("free list holds duplicate offsets");
            return false;
        }

        let mut limbo: HashSet<BlockOffset> = self.pending.keys().copied().collect();
        limbo.extend(self.reclaims.iter().map(|entry| entry.offset));
        limbo.extend(self.queue.iter().flat_map(|mv| mv.stales.iter().map(|stale| stale.offset)));

        let mut ok = true;
        if let Some(offset) = reachable.intersection(&free_set).next() {
            tracing::warn!(offset, "reachable block on the free list");
            ok = false;
        }
        if let Some(offset) = limbo.intersection(&free_set).next() {
            tracing::warn!(offset, "block in limbo on the free list");
            ok = false;
        }
        for offset in reachable.iter().chain(&free_set).chain(&limbo) {
            if !all.contains(offset) {
                tracing::warn!(offset, "offset outside the block pool");
                ok = false;
            }
        }
        let leaked = all
            .iter()
            .filter(|offset| !reachable.contains(offset) && !free_set.contains(offset) && !limbo.contains(offset))
            .count();
        if leaked > 0 {
            tracing::warn!(leaked, "blocks neither reachable, free nor in limbo");
            ok = false;
        }
        ok
    }
}
