//! Index file I/O.
//!
//! All reads and writes are positional (`pread`/`pwrite`), so one handle is
//! shared between the actor, which writes, and readers walking snapshots.
//!
//! The handle holds an exclusive lock on the file for its whole life, so a
//! second process or an unrelated handle in this one cannot open it.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt as _;

use crate::config::Layout;
use crate::storage::StoreError;
use crate::storage::block;
use crate::storage::node::{BlockOffset, Node};

/// Handle on the index file.
pub struct IndexFile {
    file: File,
    layout: Layout,
    /// File length. Only the actor grows the file.
    len: AtomicU64,
}

impl IndexFile {
    /// Create a new index file sized to hold the head and free-list copies.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, layout: Layout) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        lock(&file, path)?;
        file.set_len(layout.first_block_offset)?;

        Ok(Self {
            file,
            layout,
            len: AtomicU64::new(layout.first_block_offset),
        })
    }

    /// Open an existing index file.
    pub fn open(path: &Path, layout: Layout) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock(&file, path)?;
        let len = file.metadata()?.len();
        if len < layout.first_block_offset || (len - layout.first_block_offset) % layout.block_size != 0 {
            return Err(StoreError::Corrupted(format!(
                "index file length {len} is not a whole number of blocks"
            )));
        }

        Ok(Self {
            file,
            layout,
            len: AtomicU64::new(len),
        })
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Current length of the file in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
        write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Read and decode the node stored at `offset`.
    pub fn read_node(&self, offset: BlockOffset) -> Result<Node, StoreError> {
        self.check_offset(offset)?;
        let mut buf = vec![0u8; self.block_size()];
        self.read_at(offset, &mut buf)?;
        block::decode(&buf, offset, self.layout.max_keys)
            .map_err(|source| StoreError::Block { offset, source })
    }

    /// Encode a node and write it to its own offset.
    pub fn write_node(&self, node: &Node) -> Result<(), StoreError> {
        let offset = node.offset();
        self.check_offset(offset)?;
        let buf = block::encode(node, self.block_size());
        self.write_at(offset, &buf)
    }

    /// Append `count` zeroed blocks and return their offsets.
    pub fn extend(&self, count: usize) -> Result<Vec<BlockOffset>, StoreError> {
        let start = self.len();
        let new_len = start + count as u64 * self.layout.block_size;
        self.file.set_len(new_len)?;
        self.len.store(new_len, Ordering::Release);
        Ok((0..count as u64)
            .map(|i| start + i * self.layout.block_size)
            .collect())
    }

    /// Cut the file back to `len` bytes. Every block past `len` must be
    /// free.
    pub fn truncate(&self, len: u64) -> Result<(), StoreError> {
        self.len.store(len, Ordering::Release);
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush file data to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Every block offset of the pool, in file order.
    pub fn block_offsets(&self) -> impl Iterator<Item = BlockOffset> + use<> {
        let layout = self.layout;
        let len = self.len();
        (layout.first_block_offset..len).step_by(layout.block_size as usize)
    }

    fn check_offset(&self, offset: BlockOffset) -> Result<(), StoreError> {
        if self.layout.is_block_offset(offset) && offset < self.len() {
            Ok(())
        } else {
            Err(StoreError::InvalidOffset(offset))
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn block_size(&self) -> usize {
        self.layout.block_size as usize
    }
}

/// Take the exclusive lock without waiting.
fn lock(file: &File, path: &Path) -> Result<(), StoreError> {
    file.try_lock_exclusive().map_err(|e| {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            StoreError::Locked(path.to_path_buf())
        } else {
            e.into()
        }
    })
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::node::{KeyEntry, LeafNode};

    fn layout() -> Layout {
        StoreConfig::new("i", "k").with_block_size(512).layout()
    }

    #[test]
    fn test_create_sizes_metadata_area() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let file = IndexFile::create(&path, layout()).expect("create index file");
        assert_eq!(file.len(), layout().first_block_offset);
        assert_eq!(file.block_offsets().count(), 0);
    }

    #[test]
    fn test_create_rejects_existing() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let _file = IndexFile::create(&path, layout()).expect("create index file");
        assert!(matches!(
            IndexFile::create(&path, layout()),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_second_handle_is_locked_out() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let file = IndexFile::create(&path, layout()).expect("create index file");
        assert!(matches!(
            IndexFile::open(&path, layout()),
            Err(StoreError::Locked(_))
        ));
        drop(file);
        IndexFile::open(&path, layout()).expect("open after the first handle closed");
    }

    #[test]
    fn test_truncate_drops_tail_blocks() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let file = IndexFile::create(&path, layout()).expect("create index file");
        let offsets = file.extend(4).expect("extend file");

        file.truncate(offsets[2]).expect("truncate");
        assert_eq!(file.block_offsets().collect::<Vec<_>>(), offsets[..2]);
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), offsets[2]);
        assert!(matches!(file.read_node(offsets[3]), Err(StoreError::InvalidOffset(_))));
    }

    #[test]
    fn test_extend_and_node_round_trip() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let file = IndexFile::create(&path, layout()).expect("create index file");

        let offsets = file.extend(3).expect("extend file");
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], layout().first_block_offset);
        assert_eq!(offsets[2] - offsets[1], 512);
        assert_eq!(file.block_offsets().collect::<Vec<_>>(), offsets);

        let node = Node::Leaf(LeafNode {
            offset: offsets[1],
            dirty: false,
            keys: vec![KeyEntry::new(1, 2, 3)],
            values: vec![4],
        });
        file.write_node(&node).expect("write node");
        assert_eq!(file.read_node(offsets[1]).expect("read node"), node);
    }

    #[test]
    fn test_read_rejects_bad_offsets() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let file = IndexFile::create(&path, layout()).expect("create index file");
        let offsets = file.extend(1).expect("extend file");

        assert!(matches!(file.read_node(0), Err(StoreError::InvalidOffset(0))));
        assert!(matches!(
            file.read_node(offsets[0] + 7),
            Err(StoreError::InvalidOffset(_))
        ));
        assert!(matches!(
            file.read_node(offsets[0] + 512),
            Err(StoreError::InvalidOffset(_))
        ));
        // A zeroed block fails its checksum.
        assert!(matches!(file.read_node(offsets[0]), Err(StoreError::Block { .. })));
    }

    #[test]
    fn test_open_rejects_partial_block() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        {
            let _file = IndexFile::create(&path, layout()).expect("create index file");
        }
        let raw = OpenOptions::new().write(true).open(&path).expect("open raw");
        raw.set_len(layout().first_block_offset + 100).expect("truncate");
        assert!(matches!(
            IndexFile::open(&path, layout()),
            Err(StoreError::Corrupted(_))
        ));
    }
}
