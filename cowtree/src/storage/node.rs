//! In-memory B+tree node model.
//!
//! A node is identified by the file offset of its block. Keys reference
//! their bytes in the key/value log, so nodes are fixed-width records.
//!
//! - Internal nodes: `keys.len() + 1` child offsets
//! - Leaf nodes: one value offset per key
//!
//! # Invariants
//!
//! - Keys are sorted by (key bytes, docid bytes)
//! - For separator `keys[i]` of an internal node, every entry under
//!   `children[i]` is smaller and every entry under `children[i + 1]` is
//!   greater or equal
//! - A `dirty` node was created by a changeset and has not been drained yet

/// Byte offset of a block in the index file.
pub type BlockOffset = u64;

/// Byte offset of a record in the key/value log.
pub type LogOffset = u64;

/// A fixed-width key entry. The key and docid bytes live in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyEntry {
    pub control: u32,
    pub key_offset: LogOffset,
    pub docid_offset: LogOffset,
}

impl KeyEntry {
    /// Size of an encoded key entry in bytes.
    pub const SIZE: usize = 20;

    #[must_use]
    pub const fn new(control: u32, key_offset: LogOffset, docid_offset: LogOffset) -> Self {
        Self {
            control,
            key_offset,
            docid_offset,
        }
    }
}

/// A B+tree node, either internal or leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    /// Create an empty leaf, the root of a fresh tree.
    #[must_use]
    pub const fn empty_leaf(offset: BlockOffset) -> Self {
        Self::Leaf(LeafNode {
            offset,
            dirty: true,
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    #[must_use]
    pub const fn offset(&self) -> BlockOffset {
        match self {
            Self::Internal(node) => node.offset,
            Self::Leaf(node) => node.offset,
        }
    }

    pub const fn set_offset(&mut self, offset: BlockOffset) {
        match self {
            Self::Internal(node) => node.offset = offset,
            Self::Leaf(node) => node.offset = offset,
        }
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        match self {
            Self::Internal(node) => node.dirty,
            Self::Leaf(node) => node.dirty,
        }
    }

    pub const fn set_dirty(&mut self, dirty: bool) {
        match self {
            Self::Internal(node) => node.dirty = dirty,
            Self::Leaf(node) => node.dirty = dirty,
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub fn keys(&self) -> &[KeyEntry] {
        match self {
            Self::Internal(node) => &node.keys,
            Self::Leaf(node) => &node.keys,
        }
    }

    /// Number of keys held by the node.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Copy of this node placed at `offset`, marked dirty.
    #[must_use]
    pub fn copy_to(&self, offset: BlockOffset) -> Self {
        let mut copy = self.clone();
        copy.set_offset(offset);
        copy.set_dirty(true);
        copy
    }
}

/// Leaf node: sorted keys and their value offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub offset: BlockOffset,
    pub dirty: bool,
    pub keys: Vec<KeyEntry>,
    pub values: Vec<LogOffset>,
}

impl LeafNode {
    pub fn insert(&mut self, index: usize, key: KeyEntry, value: LogOffset) {
        self.keys.insert(index, key);
        self.values.insert(index, value);
    }

    pub fn remove(&mut self, index: usize) -> (KeyEntry, LogOffset) {
        (self.keys.remove(index), self.values.remove(index))
    }

    /// Split an overfull leaf. The left half keeps `ceil(max_keys / 2)`
    /// entries; the right half is returned with its first key, which is
    /// the separator for the parent. The new node has no offset yet.
    pub fn split(&mut self, max_keys: usize) -> (KeyEntry, Self) {
        let keep = max_keys.div_ceil(2);
        let keys = self.keys.split_off(keep);
        let values = self.values.split_off(keep);
        let separator = keys[0];
        (
            separator,
            Self {
                offset: 0,
                dirty: true,
                keys,
                values,
            },
        )
    }

    /// Prepend every entry of the left sibling.
    pub fn absorb_left(&mut self, left: &Self) {
        self.keys.splice(0..0, left.keys.iter().copied());
        self.values.splice(0..0, left.values.iter().copied());
    }

    /// Append every entry of the right sibling.
    pub fn absorb_right(&mut self, right: &Self) {
        self.keys.extend_from_slice(&right.keys);
        self.values.extend_from_slice(&right.values);
    }

    /// Move the last `count` entries of `left` to the front of this node.
    /// Returns the new separator between the two.
    pub fn borrow_from_left(&mut self, left: &mut Self, count: usize) -> KeyEntry {
        let at = left.keys.len() - count;
        let keys = left.keys.split_off(at);
        let values = left.values.split_off(at);
        self.keys.splice(0..0, keys);
        self.values.splice(0..0, values);
        self.keys[0]
    }

    /// Move the first `count` entries of `right` to the end of this node.
    /// Returns the new separator between the two.
    pub fn borrow_from_right(&mut self, right: &mut Self, count: usize) -> KeyEntry {
        self.keys.extend(right.keys.drain(..count));
        self.values.extend(right.values.drain(..count));
        right.keys[0]
    }
}

/// Internal node: separators and `keys.len() + 1` child offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub offset: BlockOffset,
    pub dirty: bool,
    pub keys: Vec<KeyEntry>,
    pub children: Vec<BlockOffset>,
}

impl InternalNode {
    /// Create a root above two children.
    #[must_use]
    pub fn new_root(
        offset: BlockOffset,
        separator: KeyEntry,
        left: BlockOffset,
        right: BlockOffset,
    ) -> Self {
        Self {
            offset,
            dirty: true,
            keys: vec![separator],
            children: vec![left, right],
        }
    }

    /// Insert a separator at `index` with `right` as the child after it.
    pub fn insert_child(&mut self, index: usize, separator: KeyEntry, right: BlockOffset) {
        self.keys.insert(index, separator);
        self.children.insert(index + 1, right);
    }

    /// Remove separator `key_index` and the child at `child_index`.
    pub fn remove_child(&mut self, key_index: usize, child_index: usize) {
        self.keys.remove(key_index);
        self.children.remove(child_index);
    }

    /// Split an overfull internal node. The median key moves up to the
    /// parent; the left half keeps `max_keys / 2` keys.
    pub fn split(&mut self, max_keys: usize) -> (KeyEntry, Self) {
        let mid = max_keys / 2;
        let mut keys = self.keys.split_off(mid);
        let children = self.children.split_off(mid + 1);
        let separator = keys.remove(0);
        (
            separator,
            Self {
                offset: 0,
                dirty: true,
                keys,
                children,
            },
        )
    }

    /// Pull the left sibling and the separator between us into this node.
    pub fn absorb_left(&mut self, left: &Self, separator: KeyEntry) {
        let mut keys = left.keys.clone();
        keys.push(separator);
        self.keys.splice(0..0, keys);
        self.children.splice(0..0, left.children.iter().copied());
    }

    /// Pull the separator and the right sibling into this node.
    pub fn absorb_right(&mut self, separator: KeyEntry, right: &Self) {
        self.keys.push(separator);
        self.keys.extend_from_slice(&right.keys);
        self.children.extend_from_slice(&right.children);
    }

    /// Rotate `count` children from the end of `left` through the parent
    /// separator. Returns the separator that replaces it.
    pub fn borrow_from_left(&mut self, left: &mut Self, separator: KeyEntry, count: usize) -> KeyEntry {
        let at = left.keys.len() - count;
        let mut moved = left.keys.split_off(at);
        let up = moved.remove(0);
        moved.push(separator);
        self.keys.splice(0..0, moved);
        let children = left.children.split_off(left.children.len() - count);
        self.children.splice(0..0, children);
        up
    }

    /// Rotate `count` children from the front of `right` through the parent
    /// separator. Returns the separator that replaces it.
    pub fn borrow_from_right(&mut self, right: &mut Self, separator: KeyEntry, count: usize) -> KeyEntry {
        self.keys.push(separator);
        self.keys.extend(right.keys.drain(..count - 1));
        let up = right.keys.remove(0);
        self.children.extend(right.children.drain(..count));
        up
    }
}
