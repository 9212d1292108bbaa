//! Store error type.
//!
//! Recoverable failures (I/O, bad configuration, on-disk corruption found
//! while opening or reading) are returned as [`StoreError`]. Broken internal
//! bookkeeping and caller contract violations panic instead.

use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::storage::block::BlockError;
use crate::storage::node::BlockOffset;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error on the index file or the log.
    Io(std::io::Error),
    /// Configuration rejected.
    Config(ConfigError),
    /// A block failed to decode.
    Block {
        offset: BlockOffset,
        source: BlockError,
    },
    /// The index file already exists.
    AlreadyExists(PathBuf),
    /// Another handle holds the index file open.
    Locked(PathBuf),
    /// The file was created with different sizing.
    ConfigMismatch {
        field: &'static str,
        stored: u64,
        configured: u64,
    },
    /// Head or free-list records are inconsistent.
    Corrupted(String),
    /// A block offset outside the pool or not block-aligned.
    InvalidOffset(BlockOffset),
    /// A log record that does not fit inside the log.
    CorruptRecord { offset: u64 },
    /// A lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Block { offset, source } => write!(f, "block at {offset}: {source}"),
            Self::AlreadyExists(path) => write!(f, "file already exists: {}", path.display()),
            Self::Locked(path) => write!(f, "file is in use by another store: {}", path.display()),
            Self::ConfigMismatch {
                field,
                stored,
                configured,
            } => write!(
                f,
                "{field} mismatch: file has {stored}, configuration has {configured}"
            ),
            Self::Corrupted(message) => write!(f, "store corrupted: {message}"),
            Self::InvalidOffset(offset) => write!(f, "invalid block offset: {offset}"),
            Self::CorruptRecord { offset } => write!(f, "corrupt log record at {offset}"),
            Self::LockPoisoned => write!(f, "lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Block { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
