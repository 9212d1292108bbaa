// Life of a write:
// 1. Key, docid and value bytes are appended to the key/value log
// 2. The writer takes a snapshot (epoch + root) from the MVCC actor
// 3. Every node on the path is copied to a fresh block (changeset)
// 4. The changeset is committed: its root becomes current at once
// 5. Queued changesets are drained to disk in batches; the head is
//    published after the nodes and the free list
// 6. Superseded blocks return to the free list once no reader can see them
//
// System components:
//  - Index file (head, free list, block pool)
//  - MVCC actor (root, node cache, free list, epochs, drain queue)
//  - Key/value log actor

pub mod config;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, StoreConfig};
pub use registry::StoreRegistry;
pub use storage::{Entry, Scan, Store, StoreError, StoreStats};
