//! Block codec.
//!
//! Every node occupies one fixed-size block of the index file.
//!
//! # Layout
//!
//! ```text
//! [0]      kind (0 = internal, 1 = leaf)
//! [1..4]   reserved
//! [4..8]   count (u32 LE)
//! [8..12]  CRC32 of bytes 16..end-of-body (u32 LE)
//! [12..16] reserved
//! [16..]   count key entries {control u32, key_offset u64, docid_offset u64}
//!          count + 1 offsets (u64): children, or values plus one zero slot
//! ```
//!
//! All integers are little-endian. Bytes after the body are zero.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::storage::node::{BlockOffset, InternalNode, KeyEntry, LeafNode, Node};

/// Size of the fixed block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of one child or value offset.
const OFFSET_SIZE: usize = 8;

/// Block kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Internal = 0,
    Leaf = 1,
}

impl TryFrom<u8> for BlockKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Errors raised while decoding a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Declared key count exceeds what the block can hold.
    CorruptBlock { count: usize, capacity: usize },
    /// Unknown kind byte.
    InvalidKind(u8),
    /// Body checksum does not match the header.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Buffer shorter than a block.
    Truncated { len: usize, block_size: usize },
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptBlock { count, capacity } => {
                write!(f, "corrupt block: count {count} exceeds capacity {capacity}")
            }
            Self::InvalidKind(kind) => write!(f, "invalid block kind: {kind}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "block checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::Truncated { len, block_size } => {
                write!(f, "block truncated: {len} of {block_size} bytes")
            }
        }
    }
}

impl std::error::Error for BlockError {}

/// Encoded size of a node holding `count` keys.
#[must_use]
pub const fn encoded_size(count: usize) -> usize {
    BLOCK_HEADER_SIZE + count * KeyEntry::SIZE + (count + 1) * OFFSET_SIZE
}

/// Largest even key count whose encoding fits in `block_size` bytes.
#[must_use]
pub const fn max_keys(block_size: u64) -> usize {
    let fixed = (BLOCK_HEADER_SIZE + OFFSET_SIZE) as u64;
    if block_size <= fixed {
        return 0;
    }
    let count = ((block_size - fixed) / (KeyEntry::SIZE + OFFSET_SIZE) as u64) as usize;
    count - count % 2
}

/// Encode a node into a zero-padded block.
///
/// # Panics
///
/// Panics if the node does not fit in `block_size` bytes. Flushing an
/// oversized node would corrupt its neighbour.
#[must_use]
pub fn encode(node: &Node, block_size: usize) -> Vec<u8> {
    let count = node.len();
    let size = encoded_size(count);
    if size > block_size {
        tracing::error!(offset = node.offset(), count, "node exceeds block size");
        panic!(
            "node at offset {} needs {size} bytes, block size is {block_size}",
            node.offset()
        );
    }

    let mut buf = vec![0u8; block_size];
    let kind = if node.is_leaf() {
        BlockKind::Leaf
    } else {
        BlockKind::Internal
    };
    buf[0] = kind as u8;
    buf[4..8].copy_from_slice(&(count as u32).to_le_bytes());

    let mut pos = BLOCK_HEADER_SIZE;
    for key in node.keys() {
        buf[pos..pos + 4].copy_from_slice(&key.control.to_le_bytes());
        buf[pos + 4..pos + 12].copy_from_slice(&key.key_offset.to_le_bytes());
        buf[pos + 12..pos + 20].copy_from_slice(&key.docid_offset.to_le_bytes());
        pos += KeyEntry::SIZE;
    }

    let offsets = match node {
        Node::Internal(node) => node.children.as_slice(),
        Node::Leaf(node) => node.values.as_slice(),
    };
    for offset in offsets {
        buf[pos..pos + OFFSET_SIZE].copy_from_slice(&offset.to_le_bytes());
        pos += OFFSET_SIZE;
    }
    // Leaves leave the trailing reserved slot zeroed.

    let crc = crc32fast::hash(&buf[BLOCK_HEADER_SIZE..size]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode a block read from `offset`.
///
/// Fails with [`BlockError::CorruptBlock`] when the declared count exceeds
/// `max_keys`.
pub fn decode(buf: &[u8], offset: BlockOffset, max_keys: usize) -> Result<Node, BlockError> {
    if buf.len() < encoded_size(0) {
        return Err(BlockError::Truncated {
            len: buf.len(),
            block_size: encoded_size(0),
        });
    }

    let kind = BlockKind::try_from(buf[0]).map_err(BlockError::InvalidKind)?;
    let count = read_u32(buf, 4) as usize;
    if count > max_keys {
        return Err(BlockError::CorruptBlock {
            count,
            capacity: max_keys,
        });
    }
    let size = encoded_size(count);
    if buf.len() < size {
        return Err(BlockError::Truncated {
            len: buf.len(),
            block_size: size,
        });
    }

    let expected = read_u32(buf, 8);
    let actual = crc32fast::hash(&buf[BLOCK_HEADER_SIZE..size]);
    if expected != actual {
        return Err(BlockError::ChecksumMismatch { expected, actual });
    }

    let mut pos = BLOCK_HEADER_SIZE;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(KeyEntry::new(
            read_u32(buf, pos),
            read_u64(buf, pos + 4),
            read_u64(buf, pos + 12),
        ));
        pos += KeyEntry::SIZE;
    }

    let node = match kind {
        BlockKind::Internal => {
            let children = (0..=count)
                .map(|i| read_u64(buf, pos + i * OFFSET_SIZE))
                .collect();
            Node::Internal(InternalNode {
                offset,
                dirty: false,
                keys,
                children,
            })
        }
        BlockKind::Leaf => {
            let values = (0..count)
                .map(|i| read_u64(buf, pos + i * OFFSET_SIZE))
                .collect();
            Node::Leaf(LeafNode {
                offset,
                dirty: false,
                keys,
                values,
            })
        }
    };
    Ok(node)
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}
