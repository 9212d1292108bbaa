//! Free-block list.
//!
//! Offsets of blocks that hold no live node. `pop` hands out the oldest
//! offset, `add` appends returned ones.
//!
//! # Layout
//!
//! ```text
//! [0..4]  count (u32 LE)
//! [4..8]  reserved
//! [8..]   count offsets (u64 LE), zero padded to free_list_size
//! ```
//!
//! Two copies follow the head sectors; copy 2 is written first. The CRC32 of
//! the whole record is kept in the head, so a crash between writing the
//! free list and the head is detected on load.
//!
//! The in-memory list is unbounded. When it outgrows the record only the
//! first `capacity` offsets are written and the head is flagged, so the
//! rest are recomputed from the tree on the next open.

use std::collections::VecDeque;

use crate::config::Layout;
use crate::storage::StoreError;
use crate::storage::file::IndexFile;
use crate::storage::node::BlockOffset;

/// Size of the record header.
const FREELIST_HEADER_SIZE: usize = 8;

/// In-memory free list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    offsets: VecDeque<BlockOffset>,
    capacity: usize,
    low_watermark: usize,
    /// Changed since the last flush.
    dirty: bool,
}

impl FreeList {
    #[must_use]
    pub fn new(layout: &Layout) -> Self {
        Self {
            offsets: VecDeque::new(),
            capacity: layout.freelist_capacity,
            low_watermark: layout.max_level * 2,
            dirty: false,
        }
    }

    /// Remove and return the first free offset.
    pub fn pop(&mut self) -> Option<BlockOffset> {
        let offset = self.offsets.pop_front()?;
        self.dirty = true;
        Some(offset)
    }

    /// Append offsets.
    pub fn add(&mut self, offsets: impl IntoIterator<Item = BlockOffset>) {
        let before = self.offsets.len();
        self.offsets.extend(offsets);
        if self.offsets.len() != before {
            self.dirty = true;
        }
    }

    /// Drop every offset at or past `end`. Returns how many were dropped.
    pub fn truncate_at(&mut self, end: BlockOffset) -> usize {
        let before = self.offsets.len();
        self.offsets.retain(|&offset| offset < end);
        let dropped = before - self.offsets.len();
        if dropped > 0 {
            self.dirty = true;
        }
        dropped
    }

    /// Replace the whole list.
    pub fn reset(&mut self, offsets: impl IntoIterator<Item = BlockOffset>) {
        self.offsets = offsets.into_iter().collect();
        self.dirty = true;
    }

    /// Number of offsets the on-disk record holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The list no longer fits its on-disk record.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.offsets.len() > self.capacity
    }

    /// Whether free space fell under the low watermark.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.offsets.len() < self.low_watermark
    }

    /// Number of offsets to append so that the list reaches the extension
    /// target for `append_ratio`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    #[must_use]
    pub fn extension_size(&self, append_ratio: f64) -> usize {
        let target = ((self.capacity as f64 * append_ratio) as usize)
            .max(self.low_watermark + 1)
            .min(self.capacity);
        target.saturating_sub(self.offsets.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockOffset> + '_ {
        self.offsets.iter().copied()
    }

    /// Encode into a record of `free_list_size` bytes. Only the first
    /// `capacity` offsets are written.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn encode(&self, free_list_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; free_list_size as usize];
        let count = self.offsets.len().min(self.capacity);
        buf[0..4].copy_from_slice(&(count as u32).to_le_bytes());
        for (i, offset) in self.offsets.iter().take(count).enumerate() {
            let pos = FREELIST_HEADER_SIZE + i * 8;
            buf[pos..pos + 8].copy_from_slice(&offset.to_le_bytes());
        }
        buf
    }

    /// Decode a record.
    pub fn decode(buf: &[u8], layout: &Layout) -> Result<Self, StoreError> {
        let count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if count > layout.freelist_capacity {
            return Err(StoreError::Corrupted(format!(
                "free list count {count} exceeds capacity {}",
                layout.freelist_capacity
            )));
        }
        let mut list = Self::new(layout);
        for i in 0..count {
            let pos = FREELIST_HEADER_SIZE + i * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[pos..pos + 8]);
            let offset = u64::from_le_bytes(bytes);
            if !layout.is_block_offset(offset) {
                return Err(StoreError::InvalidOffset(offset));
            }
            list.offsets.push_back(offset);
        }
        Ok(list)
    }

    /// Write both copies, copy 2 first. Returns the record checksum for
    /// the head.
    pub fn flush(&mut self, file: &IndexFile) -> Result<u32, StoreError> {
        let layout = file.layout();
        let buf = self.encode(layout.free_list_size);
        file.write_at(layout.freelist_copy2_offset(), &buf)?;
        file.write_at(layout.freelist_copy1_offset(), &buf)?;
        self.dirty = false;
        Ok(crc32fast::hash(&buf))
    }

    /// Load and cross-check both copies against the checksum in the head.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load(file: &IndexFile, expected_crc: u32) -> Result<Self, StoreError> {
        let layout = file.layout();
        let mut copy1 = vec![0u8; layout.free_list_size as usize];
        let mut copy2 = vec![0u8; layout.free_list_size as usize];
        file.read_at(layout.freelist_copy1_offset(), &mut copy1)?;
        file.read_at(layout.freelist_copy2_offset(), &mut copy2)?;
        if copy1 != copy2 {
            tracing::error!("free list copies differ");
            return Err(StoreError::Corrupted("free list copies differ".to_string()));
        }
        if crc32fast::hash(&copy1) != expected_crc {
            tracing::error!("free list does not match head");
            return Err(StoreError::Corrupted(
                "free list checksum does not match head".to_string(),
            ));
        }
        let offsets = Self::decode(&copy1, layout)?;
        for offset in offsets.iter() {
            if offset >= file.len() {
                return Err(StoreError::InvalidOffset(offset));
            }
        }
        Ok(offsets)
    }
}
