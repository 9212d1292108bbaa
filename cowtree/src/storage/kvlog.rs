//! Key/value append log.
//!
//! Raw key, docid and value bytes are appended to a separate file as
//! `{i32 length}{payload}` records; nodes reference them by the record's
//! offset. A dedicated thread owns the file and an offset-keyed record
//! cache, so appends never contend with tree mutation.
//!
//! # Concurrency
//!
//! [`KvLog`] is a cloneable handle. Every call is a blocking round trip to
//! the actor thread and must not be made from inside an async runtime
//! worker.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};

use crate::storage::StoreError;
use crate::storage::file::{read_exact_at, write_all_at};
use crate::storage::node::LogOffset;

/// Size of the record length prefix.
const RECORD_HEADER_SIZE: u64 = 4;

/// Depth of the command queue.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Counters reported by the log actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvStats {
    pub appends: u64,
    pub reads: u64,
    pub cache_hits: u64,
    pub cache_evictions: u64,
    pub prefetched: u64,
    /// Current length of the log in bytes.
    pub len: u64,
}

enum KvCommand {
    Append {
        records: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Vec<LogOffset>, StoreError>>,
    },
    Read {
        offset: LogOffset,
        reply: oneshot::Sender<Result<Arc<[u8]>, StoreError>>,
    },
    Prefetch {
        offsets: Vec<LogOffset>,
    },
    Sync {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Stats {
        reply: oneshot::Sender<KvStats>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Handle on the log actor.
#[derive(Clone)]
pub struct KvLog {
    tx: mpsc::Sender<KvCommand>,
}

impl KvLog {
    /// Create a new, empty log and start its actor.
    pub fn create(
        path: &Path,
        cache_entries: usize,
    ) -> Result<(Self, JoinHandle<()>), StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::spawn(file, cache_entries)
    }

    /// Open an existing log and start its actor.
    pub fn open(path: &Path, cache_entries: usize) -> Result<(Self, JoinHandle<()>), StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::spawn(file, cache_entries)
    }

    fn spawn(file: File, cache_entries: usize) -> Result<(Self, JoinHandle<()>), StoreError> {
        let len = file.metadata()?.len();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = LogActor {
            file,
            len,
            cache: NonZeroUsize::new(cache_entries).map(LruCache::new),
            stats: KvStats::default(),
        };
        let handle = std::thread::Builder::new()
            .name("cowtree-kvlog".to_string())
            .spawn(move || actor.run(rx))?;
        Ok((Self { tx }, handle))
    }

    /// Append one record. Returns its offset.
    pub fn append(&self, bytes: Vec<u8>) -> Result<LogOffset, StoreError> {
        let offsets = self.append_all(vec![bytes])?;
        Ok(offsets[0])
    }

    /// Append records back to back. Returns their offsets in order.
    pub fn append_all(&self, records: Vec<Vec<u8>>) -> Result<Vec<LogOffset>, StoreError> {
        self.request(|reply| KvCommand::Append { records, reply })
    }

    /// Read the record at `offset`.
    pub fn read(&self, offset: LogOffset) -> Result<Arc<[u8]>, StoreError> {
        self.request(|reply| KvCommand::Read { offset, reply })
    }

    /// Warm the cache for records that will be read soon.
    pub fn prefetch(&self, offsets: Vec<LogOffset>) {
        self.send(KvCommand::Prefetch { offsets });
    }

    /// Make every appended record durable.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.request(|reply| KvCommand::Sync { reply })
    }

    #[must_use]
    pub fn stats(&self) -> KvStats {
        self.request(|reply| KvCommand::Stats { reply })
    }

    /// Sync the log and stop the actor.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.request(|reply| KvCommand::Shutdown { reply })
    }

    fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> KvCommand) -> T {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply));
        match rx.blocking_recv() {
            Ok(value) => value,
            Err(_) => panic!("key/value log actor terminated"),
        }
    }

    fn send(&self, command: KvCommand) {
        if self.tx.blocking_send(command).is_err() {
            panic!("key/value log actor terminated");
        }
    }
}

struct LogActor {
    file: File,
    len: u64,
    cache: Option<LruCache<LogOffset, Arc<[u8]>>>,
    stats: KvStats,
}

impl LogActor {
    fn run(mut self, mut rx: mpsc::Receiver<KvCommand>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                KvCommand::Append { records, reply } => {
                    let _ = reply.send(self.append(records));
                }
                KvCommand::Read { offset, reply } => {
                    let _ = reply.send(self.read(offset));
                }
                KvCommand::Prefetch { offsets } => {
                    for offset in offsets {
                        if self.read(offset).is_ok() {
                            self.stats.prefetched += 1;
                        }
                    }
                }
                KvCommand::Sync { reply } => {
                    let _ = reply.send(self.file.sync_data().map_err(StoreError::from));
                }
                KvCommand::Stats { reply } => {
                    let _ = reply.send(KvStats {
                        len: self.len,
                        ..self.stats
                    });
                }
                KvCommand::Shutdown { reply } => {
                    let _ = reply.send(self.file.sync_all().map_err(StoreError::from));
                    break;
                }
            }
        }
        tracing::debug!(appends = self.stats.appends, "key/value log stopped");
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn append(&mut self, records: Vec<Vec<u8>>) -> Result<Vec<LogOffset>, StoreError> {
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in &records {
            offsets.push(self.len + buf.len() as u64);
            buf.extend_from_slice(&(record.len() as i32).to_le_bytes());
            buf.extend_from_slice(record);
        }
        write_all_at(&self.file, &buf, self.len)?;
        self.len += buf.len() as u64;
        self.stats.appends += records.len() as u64;

        for (offset, record) in offsets.iter().zip(records) {
            self.cache_put(*offset, Arc::from(record));
        }
        Ok(offsets)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn read(&mut self, offset: LogOffset) -> Result<Arc<[u8]>, StoreError> {
        self.stats.reads += 1;
        if let Some(bytes) = self.cache.as_mut().and_then(|cache| cache.get(&offset)) {
            self.stats.cache_hits += 1;
            return Ok(Arc::clone(bytes));
        }

        if offset + RECORD_HEADER_SIZE > self.len {
            return Err(StoreError::CorruptRecord { offset });
        }
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        read_exact_at(&self.file, &mut header, offset)?;
        let length = i32::from_le_bytes(header);
        if length < 0 || offset + RECORD_HEADER_SIZE + length as u64 > self.len {
            return Err(StoreError::CorruptRecord { offset });
        }

        let mut payload = vec![0u8; length as usize];
        read_exact_at(&self.file, &mut payload, offset + RECORD_HEADER_SIZE)?;
        let bytes: Arc<[u8]> = Arc::from(payload);
        self.cache_put(offset, Arc::clone(&bytes));
        Ok(bytes)
    }

    fn cache_put(&mut self, offset: LogOffset, bytes: Arc<[u8]>) {
        if let Some(cache) = self.cache.as_mut() {
            if let Some((evicted, _)) = cache.push(offset, bytes) {
                if evicted != offset {
                    self.stats.cache_evictions += 1;
                }
            }
        }
    }
}
