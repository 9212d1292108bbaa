//! Copy-on-write B+tree algorithms.
//!
//! Mutations never touch a node in place. They run inside a
//! [`Changeset`], which copies each node on the mutation path to a fresh
//! block and records the superseded offset, then hand the result to the
//! MVCC actor as one [`Mv`](crate::storage::drain::Mv).
//!
//! Readers walk whatever root their snapshot captured; nothing they can
//! reach is ever rewritten.

pub mod changeset;
pub mod cursor;
pub mod insert;
pub mod remove;
pub mod search;

use std::sync::Arc;

pub use changeset::Changeset;
pub use cursor::Cursor;
pub use insert::NewEntry;
pub use search::{SearchKey, SearchResult};

use crate::storage::StoreError;
use crate::storage::node::Node;
use crate::storage::shared::Shared;

/// Number of entries below `root`. Reads nodes only, never the log.
pub fn count(shared: &Shared, root: Arc<Node>) -> Result<u64, StoreError> {
    let mut total = 0u64;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match &*node {
            Node::Leaf(leaf) => total += leaf.keys.len() as u64,
            Node::Internal(internal) => {
                for child in &internal.children {
                    stack.push(shared.fetch(*child)?);
                }
            }
        }
    }
    Ok(total)
}
