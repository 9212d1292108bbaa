//! Per-mutation working set.
//!
//! A [`Changeset`] holds the node copies one insert or remove creates.
//! The first copy-on-write of a node moves it to a freshly popped offset
//! and records the old offset as stale; later touches in the same session
//! reuse the copy.

use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::StoreError;
use crate::storage::drain::{Mv, Stale};
use crate::storage::node::{BlockOffset, Node};
use crate::storage::shared::Shared;

pub struct Changeset<'a> {
    pub(crate) shared: &'a Shared,
    /// Copies created in this session, keyed by their new offset.
    nodes: HashMap<BlockOffset, Node>,
    stales: Vec<Stale>,
    /// Session offsets whose node was dropped before commit.
    discarded: Vec<BlockOffset>,
    /// Every offset popped from the free list by this session.
    allocated: Vec<BlockOffset>,
}

impl<'a> Changeset<'a> {
    #[must_use]
    pub fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            nodes: HashMap::new(),
            stales: Vec::new(),
            discarded: Vec::new(),
            allocated: Vec::new(),
        }
    }

    /// Pop a fresh block offset.
    pub fn allocate(&mut self) -> Result<BlockOffset, StoreError> {
        let offset = self.shared.mvcc.pop_freelist()?;
        self.allocated.push(offset);
        Ok(offset)
    }

    /// Take a writable copy of the node at `offset`.
    pub fn cow(&mut self, offset: BlockOffset) -> Result<Node, StoreError> {
        if let Some(node) = self.nodes.remove(&offset) {
            return Ok(node);
        }
        let current = self.shared.fetch(offset)?;
        self.cow_node(&current)
    }

    /// Like [`Changeset::cow`] for a node already in hand.
    pub fn cow_node(&mut self, current: &Arc<Node>) -> Result<Node, StoreError> {
        if let Some(node) = self.nodes.remove(&current.offset()) {
            return Ok(node);
        }
        let offset = self.allocate()?;
        self.stales.push(Stale {
            offset: current.offset(),
            dirty: current.is_dirty(),
        });
        Ok(current.copy_to(offset))
    }

    /// Key count of the node at `offset`, seen from this session.
    pub fn len_of(&self, offset: BlockOffset) -> Result<usize, StoreError> {
        if let Some(node) = self.nodes.get(&offset) {
            return Ok(node.len());
        }
        Ok(self.shared.fetch(offset)?.len())
    }

    /// Remove the node at `offset` from the tree and return its contents.
    pub fn take(&mut self, offset: BlockOffset) -> Result<Node, StoreError> {
        if let Some(node) = self.nodes.remove(&offset) {
            self.discarded.push(offset);
            return Ok(node);
        }
        let current = self.shared.fetch(offset)?;
        self.stales.push(Stale {
            offset,
            dirty: current.is_dirty(),
        });
        Ok(Node::clone(&current))
    }

    /// Drop a session copy.
    pub fn discard(&mut self, node: Node) {
        debug_assert!(node.is_dirty());
        self.discarded.push(node.offset());
    }

    /// Store a session copy until commit.
    pub fn put(&mut self, node: Node) {
        self.nodes.insert(node.offset(), node);
    }

    /// Turn the session into a changeset rooted at `root`, plus the popped
    /// offsets that ended up unused.
    #[must_use]
    pub fn finish(self, root: BlockOffset) -> (Mv, Vec<BlockOffset>) {
        let commits = self.nodes.into_values().map(Arc::new).collect();
        let mv = Mv {
            timestamp: 0,
            root,
            commits,
            stales: self.stales,
        };
        (mv, self.discarded)
    }

    /// Abandon the session. Returns every offset it popped.
    #[must_use]
    pub fn abort(self) -> Vec<BlockOffset> {
        self.allocated
    }
}
