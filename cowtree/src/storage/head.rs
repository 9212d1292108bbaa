//! Head record.
//!
//! The head names the durable root and the sizing the file was created
//! with. It is stored twice, at offset 0 and at `sector_size`.
//!
//! # Layout (first 64 bytes of each head sector)
//!
//! ```text
//! [0..8]   magic "CWTHEAD1"
//! [8..12]  version
//! [12..16] flags (bit 0: the free-list record holds only a prefix)
//! [16..24] root offset
//! [24..32] sector size
//! [32..40] free-list size
//! [40..48] block size
//! [48..56] timestamp of the last drained changeset
//! [56..60] CRC32 of the free-list record
//! [60..64] CRC32 of bytes 0..60
//! ```
//!
//! # Write order
//!
//! Copy 2 is written before copy 1. On load both sectors must be byte for
//! byte identical; any difference is reported as corruption and the store
//! is not opened.

use crate::config::Layout;
use crate::storage::StoreError;
use crate::storage::file::IndexFile;
use crate::storage::node::BlockOffset;

/// Encoded size of the head record.
pub const HEAD_RECORD_SIZE: usize = 64;

const HEAD_MAGIC: &[u8; 8] = b"CWTHEAD1";
const HEAD_VERSION: u32 = 1;
const FLAG_PARTIAL_FREELIST: u32 = 1;

/// Durable root pointer and file sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub root: BlockOffset,
    pub sector_size: u64,
    pub free_list_size: u64,
    pub block_size: u64,
    pub timestamp: u64,
    pub freelist_crc: u32,
    /// The free-list record could not hold every free offset. The
    /// free blocks are recomputed from the tree on open.
    pub partial_freelist: bool,
}

impl Head {
    #[must_use]
    pub const fn new(layout: &Layout, root: BlockOffset) -> Self {
        Self {
            root,
            sector_size: layout.sector_size,
            free_list_size: layout.free_list_size,
            block_size: layout.block_size,
            timestamp: 0,
            freelist_crc: 0,
            partial_freelist: false,
        }
    }

    /// Encode into a zero-padded sector.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn to_sector(&self, sector_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; sector_size as usize];
        buf[0..8].copy_from_slice(HEAD_MAGIC);
        buf[8..12].copy_from_slice(&HEAD_VERSION.to_le_bytes());
        let flags = if self.partial_freelist { FLAG_PARTIAL_FREELIST } else { 0 };
        buf[12..16].copy_from_slice(&flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.root.to_le_bytes());
        buf[24..32].copy_from_slice(&self.sector_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.free_list_size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.block_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[56..60].copy_from_slice(&self.freelist_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode a head sector.
    pub fn from_sector(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < HEAD_RECORD_SIZE {
            return Err(StoreError::Corrupted("head sector truncated".to_string()));
        }
        if &buf[0..8] != HEAD_MAGIC {
            return Err(StoreError::Corrupted("bad head magic".to_string()));
        }
        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != HEAD_VERSION {
            return Err(StoreError::Corrupted(format!("unsupported head version {version}")));
        }
        let stored = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        if stored != crc32fast::hash(&buf[0..60]) {
            return Err(StoreError::Corrupted("head checksum mismatch".to_string()));
        }

        let flags = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Ok(Self {
            root: read_u64(buf, 16),
            sector_size: read_u64(buf, 24),
            free_list_size: read_u64(buf, 32),
            block_size: read_u64(buf, 40),
            timestamp: read_u64(buf, 48),
            freelist_crc: u32::from_le_bytes([buf[56], buf[57], buf[58], buf[59]]),
            partial_freelist: flags & FLAG_PARTIAL_FREELIST != 0,
        })
    }

    /// Reject a file created with different sizing.
    pub fn verify_layout(&self, layout: &Layout) -> Result<(), StoreError> {
        let fields = [
            ("sector_size", self.sector_size, layout.sector_size),
            ("free_list_size", self.free_list_size, layout.free_list_size),
            ("block_size", self.block_size, layout.block_size),
        ];
        for (field, stored, configured) in fields {
            if stored != configured {
                return Err(StoreError::ConfigMismatch {
                    field,
                    stored,
                    configured,
                });
            }
        }
        Ok(())
    }

    /// Write both copies, copy 2 first.
    pub fn flush(&self, file: &IndexFile) -> Result<(), StoreError> {
        let layout = file.layout();
        let buf = self.to_sector(layout.sector_size);
        file.write_at(layout.head_copy2_offset(), &buf)?;
        file.write_at(0, &buf)
    }

    /// Load and cross-check both copies.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load(file: &IndexFile) -> Result<Self, StoreError> {
        let layout = file.layout();
        let mut copy1 = vec![0u8; layout.sector_size as usize];
        let mut copy2 = vec![0u8; layout.sector_size as usize];
        file.read_at(0, &mut copy1)?;
        file.read_at(layout.head_copy2_offset(), &mut copy2)?;
        if copy1 != copy2 {
            tracing::error!("head copies differ");
            return Err(StoreError::Corrupted("head copies differ".to_string()));
        }
        let head = Self::from_sector(&copy1)?;
        head.verify_layout(layout)?;
        Ok(head)
    }
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}
