//! Copy-on-write remove with rebalancing.
//!
//! The descent is read-only, so a miss costs no allocation. The path is
//! copied bottom-up once the entry is known to exist. A child left under
//! the rebalance threshold either takes entries from a sibling or merges
//! with it:
//!
//! - rotate `max((sibling - threshold) / 2, threshold - child)` entries
//!   across, from the left sibling if it can spare them, else the right
//! - merge when neither can: the pair would fill less than 60% of a node,
//!   or the sibling is at the threshold itself. The left sibling is
//!   merged when there is one
//!
//! An internal root left without keys is replaced by its only child.

use std::sync::Arc;

use crate::storage::StoreError;
use crate::storage::btree::changeset::Changeset;
use crate::storage::btree::search::{SearchKey, search};
use crate::storage::node::{BlockOffset, InternalNode, Node};
use crate::storage::shared::Shared;

/// Locate `key`/`docid` below `root`. Returns the path of `(node, index)`
/// frames from the root down to the leaf holding the entry.
pub fn find_path(
    shared: &Shared,
    root: Arc<Node>,
    key: &[u8],
    docid: &[u8],
) -> Result<Option<Vec<(Arc<Node>, usize)>>, StoreError> {
    let target = SearchKey::exact(key, docid);
    let mut path = Vec::new();
    let mut node = root;
    loop {
        let found = search(&shared.kv, node.keys(), &target)?;
        let next = match &*node {
            Node::Leaf(_) => None,
            Node::Internal(internal) => Some(internal.children[found.child_index()]),
        };
        match next {
            None => {
                if !found.exact {
                    return Ok(None);
                }
                path.push((node, found.index));
                return Ok(Some(path));
            }
            Some(child) => {
                let child = shared.fetch(child)?;
                path.push((node, found.child_index()));
                node = child;
            }
        }
    }
}

/// Remove the leaf entry at the end of `path`. Returns the new root.
pub fn remove(cs: &mut Changeset<'_>, mut path: Vec<(Arc<Node>, usize)>) -> Result<BlockOffset, StoreError> {
    let Some((leaf, index)) = path.pop() else {
        panic!("remove called with an empty path");
    };
    let mut child = cs.cow_node(&leaf)?;
    match &mut child {
        Node::Leaf(leaf) => {
            leaf.remove(index);
        }
        Node::Internal(_) => panic!("remove path does not end at a leaf"),
    }

    let threshold = cs.shared.layout.rebalance_threshold;
    while let Some((parent, index)) = path.pop() {
        let Node::Internal(mut parent) = cs.cow_node(&parent)? else {
            panic!("leaf node on the interior of a remove path");
        };
        parent.children[index] = child.offset();
        if child.len() < threshold {
            rebalance(cs, &mut parent, index, child)?;
        } else {
            cs.put(child);
        }
        child = Node::Internal(parent);
    }

    if let Node::Internal(root) = &child
        && root.keys.is_empty()
    {
        let new_root = root.children[0];
        cs.discard(child);
        return Ok(new_root);
    }
    let root = child.offset();
    cs.put(child);
    Ok(root)
}

/// Restore occupancy of `parent.children[index]`, which holds `child`.
fn rebalance(
    cs: &mut Changeset<'_>,
    parent: &mut InternalNode,
    index: usize,
    child: Node,
) -> Result<(), StoreError> {
    let max_keys = cs.shared.layout.max_keys;
    let threshold = cs.shared.layout.rebalance_threshold;
    let child_len = child.len();
    let can_lend = |sibling_len: usize| (child_len + sibling_len) * 10 >= 6 * max_keys && sibling_len > threshold;
    let count = |sibling_len: usize| ((sibling_len - threshold) / 2).max(threshold - child_len);

    let left = match index {
        0 => None,
        _ => Some(cs.len_of(parent.children[index - 1])?),
    };
    let right = match parent.children.get(index + 1) {
        Some(&sibling) => Some(cs.len_of(sibling)?),
        None => None,
    };

    if let Some(len) = left
        && can_lend(len)
    {
        return rotate(cs, parent, index, child, true, count(len));
    }
    if let Some(len) = right
        && can_lend(len)
    {
        return rotate(cs, parent, index, child, false, count(len));
    }
    merge(cs, parent, index, child, left.is_some())
}

/// Fold the sibling into `child`. The child keeps its offset.
fn merge(
    cs: &mut Changeset<'_>,
    parent: &mut InternalNode,
    index: usize,
    mut child: Node,
    from_left: bool,
) -> Result<(), StoreError> {
    let (separator, sibling_index) = if from_left {
        (index - 1, index - 1)
    } else {
        (index, index + 1)
    };
    let sibling = cs.take(parent.children[sibling_index])?;
    let key = parent.keys[separator];

    match (&mut child, &sibling) {
        (Node::Leaf(child), Node::Leaf(sibling)) => {
            if from_left {
                child.absorb_left(sibling);
            } else {
                child.absorb_right(sibling);
            }
        }
        (Node::Internal(child), Node::Internal(sibling)) => {
            if from_left {
                child.absorb_left(sibling, key);
            } else {
                child.absorb_right(key, sibling);
            }
        }
        _ => panic!("siblings at different depths"),
    }
    parent.remove_child(separator, sibling_index);
    cs.put(child);
    Ok(())
}

/// Move `count` entries from the sibling into `child`.
fn rotate(
    cs: &mut Changeset<'_>,
    parent: &mut InternalNode,
    index: usize,
    mut child: Node,
    from_left: bool,
    count: usize,
) -> Result<(), StoreError> {
    let (separator, sibling_index) = if from_left {
        (index - 1, index - 1)
    } else {
        (index, index + 1)
    };
    let mut sibling = cs.cow(parent.children[sibling_index])?;
    parent.children[sibling_index] = sibling.offset();
    let key = parent.keys[separator];

    parent.keys[separator] = match (&mut child, &mut sibling) {
        (Node::Leaf(child), Node::Leaf(sibling)) => {
            if from_left {
                child.borrow_from_left(sibling, count)
            } else {
                child.borrow_from_right(sibling, count)
            }
        }
        (Node::Internal(child), Node::Internal(sibling)) => {
            if from_left {
                child.borrow_from_left(sibling, key, count)
            } else {
                child.borrow_from_right(sibling, key, count)
            }
        }
        _ => panic!("siblings at different depths"),
    };
    cs.put(sibling);
    cs.put(child);
    Ok(())
}
