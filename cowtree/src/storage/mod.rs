//! Disk-backed copy-on-write B+tree storage.
//!
//! # Index file layout
//!
//! ```text
//! [0)                                   head copy 1      (sector_size)
//! [sector_size)                         head copy 2      (sector_size)
//! [2 * sector_size)                     free list copy 1 (free_list_size)
//! [2 * sector_size + free_list_size)    free list copy 2 (free_list_size)
//! [first_block_offset ..)               block pool       (block_size each)
//! ```
//!
//! Keys, docids and values live in a separate append-only log; blocks refer
//! to them by log offset.
//!
//! # Components
//!
//! - [`node`], [`block`]: in-memory nodes and their block codec
//! - [`btree`]: search, insert and remove, all copy-on-write
//! - [`head`], [`freelist`]: dual-copy durable records
//! - [`mvcc`]: the actor owning root, cache, free list and reader epochs
//! - [`drain`]: batching of committed changesets to disk
//! - [`kvlog`]: the key/value log actor
//! - [`store`]: the public handle

pub mod block;
pub mod btree;
pub mod cache;
mod check;
pub mod drain;
mod error;
pub mod file;
pub mod freelist;
pub mod head;
pub mod kvlog;
pub mod mvcc;
pub mod node;
pub mod shared;
pub mod store;

pub use block::BlockError;
pub use cache::CacheStats;
pub use error::StoreError;
pub use kvlog::KvStats;
pub use mvcc::{Epoch, StoreStats};
pub use store::{Entry, Scan, Store};
