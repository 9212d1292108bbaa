//! Copy-on-write insert with node splitting.

use crate::storage::StoreError;
use crate::storage::btree::changeset::Changeset;
use crate::storage::btree::search::{SearchKey, search};
use crate::storage::node::{BlockOffset, InternalNode, KeyEntry, LogOffset, Node};

/// An entry to place in the tree. Its bytes are already in the log.
#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    pub key: &'a [u8],
    pub docid: &'a [u8],
    pub entry: KeyEntry,
    pub value: LogOffset,
}

/// Insert `new` below `root`. Returns the offset of the new root.
///
/// # Panics
///
/// Panics when the key and docid pair is already present.
pub fn insert(cs: &mut Changeset<'_>, root: BlockOffset, new: &NewEntry<'_>) -> Result<BlockOffset, StoreError> {
    let (root, split) = insert_into(cs, root, new)?;
    let Some((separator, right)) = split else {
        return Ok(root);
    };
    let offset = cs.allocate()?;
    cs.put(Node::Internal(InternalNode::new_root(offset, separator, root, right)));
    Ok(offset)
}

/// Insert into the subtree at `offset`. Returns the subtree's new offset
/// and, when it split, the separator and offset of the new right sibling.
fn insert_into(
    cs: &mut Changeset<'_>,
    offset: BlockOffset,
    new: &NewEntry<'_>,
) -> Result<(BlockOffset, Option<(KeyEntry, BlockOffset)>), StoreError> {
    let target = SearchKey::exact(new.key, new.docid);
    let mut node = cs.cow(offset)?;
    let found = search(&cs.shared.kv, node.keys(), &target)?;

    match &mut node {
        Node::Leaf(leaf) => {
            if found.exact {
                tracing::error!(index = found.index, "duplicate key and docid on insert");
                panic!("key and docid already present; remove before inserting again");
            }
            leaf.insert(found.index, new.entry, new.value);
        }
        Node::Internal(internal) => {
            let index = found.child_index();
            let (child, split) = insert_into(cs, internal.children[index], new)?;
            internal.children[index] = child;
            if let Some((separator, right)) = split {
                internal.insert_child(index, separator, right);
            }
        }
    }

    let max_keys = cs.shared.layout.max_keys;
    let split = if node.len() > max_keys {
        let offset = cs.allocate()?;
        let (separator, mut right) = match &mut node {
            Node::Leaf(leaf) => {
                let (separator, right) = leaf.split(max_keys);
                (separator, Node::Leaf(right))
            }
            Node::Internal(internal) => {
                let (separator, right) = internal.split(max_keys);
                (separator, Node::Internal(right))
            }
        };
        right.set_offset(offset);
        cs.put(right);
        Some((separator, offset))
    } else {
        None
    };

    let offset = node.offset();
    cs.put(node);
    Ok((offset, split))
}
