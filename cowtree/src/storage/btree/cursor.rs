//! Ordered traversal of one tree version.
//!
//! Copy-on-write nodes carry no sibling links, so the cursor keeps the
//! path from the root as a stack of `(node, next index)` frames.

use std::sync::Arc;

use crate::storage::StoreError;
use crate::storage::btree::search::{SearchKey, search};
use crate::storage::node::{BlockOffset, KeyEntry, LogOffset, Node};
use crate::storage::shared::Shared;

pub struct Cursor<'a> {
    shared: &'a Shared,
    stack: Vec<(Arc<Node>, usize)>,
    /// Warm the log cache for each leaf on entry.
    prefetch: bool,
}

enum Step {
    Yield(KeyEntry, LogOffset),
    Descend(BlockOffset),
    Pop,
}

impl<'a> Cursor<'a> {
    /// Position before the first entry not smaller than `target`, or before
    /// the first entry of the tree.
    pub fn seek(
        shared: &'a Shared,
        root: Arc<Node>,
        target: Option<&SearchKey<'_>>,
        prefetch: bool,
    ) -> Result<Self, StoreError> {
        let mut cursor = Self {
            shared,
            stack: Vec::new(),
            prefetch,
        };
        let mut node = root;
        loop {
            let found = match target {
                Some(target) => Some(search(&shared.kv, node.keys(), target)?),
                None => None,
            };
            let child = match &*node {
                Node::Leaf(_) => None,
                Node::Internal(internal) => {
                    let index = found.map_or(0, |found| found.child_index());
                    Some((index, internal.children[index]))
                }
            };
            match child {
                None => {
                    let index = found.map_or(0, |found| found.index);
                    cursor.enter_leaf(node, index);
                    return Ok(cursor);
                }
                Some((index, offset)) => {
                    cursor.stack.push((node, index + 1));
                    node = shared.fetch(offset)?;
                }
            }
        }
    }

    /// Next leaf entry in order.
    pub fn next_entry(&mut self) -> Result<Option<(KeyEntry, LogOffset)>, StoreError> {
        loop {
            let step = {
                let Some((node, index)) = self.stack.last_mut() else {
                    return Ok(None);
                };
                match &**node {
                    Node::Leaf(leaf) if *index < leaf.keys.len() => {
                        let step = Step::Yield(leaf.keys[*index], leaf.values[*index]);
                        *index += 1;
                        step
                    }
                    Node::Internal(internal) if *index < internal.children.len() => {
                        let step = Step::Descend(internal.children[*index]);
                        *index += 1;
                        step
                    }
                    _ => Step::Pop,
                }
            };
            match step {
                Step::Yield(entry, value) => return Ok(Some((entry, value))),
                Step::Descend(offset) => {
                    let node = self.shared.fetch(offset)?;
                    if node.is_leaf() {
                        self.enter_leaf(node, 0);
                    } else {
                        self.stack.push((node, 0));
                    }
                }
                Step::Pop => {
                    self.stack.pop();
                }
            }
        }
    }

    fn enter_leaf(&mut self, node: Arc<Node>, index: usize) {
        if self.prefetch {
            if let Node::Leaf(leaf) = &*node {
                let offsets: Vec<LogOffset> = leaf.keys[index.min(leaf.keys.len())..]
                    .iter()
                    .flat_map(|entry| [entry.key_offset, entry.docid_offset])
                    .chain(leaf.values[index.min(leaf.values.len())..].iter().copied())
                    .collect();
                if !offsets.is_empty() {
                    self.shared.kv.prefetch(offsets);
                }
            }
        }
        self.stack.push((node, index));
    }
}
