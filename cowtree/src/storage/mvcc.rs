//! MVCC concurrency-control actor.
//!
//! One thread owns every piece of mutable shared state: the current root,
//! the node cache, the free list, the set of active reader epochs, the
//! pending commit set, the drain queue and the reclaim queue. Callers talk
//! to it through [`Mvcc`], a cloneable handle that sends a [`Command`] and
//! blocks on the reply, so root swap, free-list pop and cache update never
//! interleave.
//!
//! # Epochs
//!
//! `access` stamps a logical timestamp and records it as an active epoch.
//! `release` retires it and queues the caller's stale offsets, tagged with
//! the timestamp of the changeset that superseded them. A queued offset is
//! returned to the free list once that changeset is durable and no active
//! epoch is at or before the tag.
//!
//! # Invariants
//!
//! - Every node of an undrained changeset is in `pending`
//! - An offset is in at most one of: free list, pending, reclaim queue
//! - `published` never runs ahead of the durable head

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::config::{Layout, StoreConfig};
use crate::storage::StoreError;
use crate::storage::cache::{CacheStats, NodeCache};
use crate::storage::drain::{Mv, Stale};
use crate::storage::file::IndexFile;
use crate::storage::freelist::FreeList;
use crate::storage::head::Head;
use crate::storage::kvlog::{KvLog, KvStats};
use crate::storage::node::{BlockOffset, Node};

/// Logical timestamp issued by the actor.
pub type Epoch = u64;

/// Depth of the command queue.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub cache: CacheStats,
    pub cached_nodes: usize,
    pub freelist_pops: u64,
    pub extensions: u64,
    pub appended_blocks: u64,
    /// Free blocks cut off the end of the file.
    pub truncated_blocks: u64,
    pub head_flushes: u64,
    pub freelist_flushes: u64,
    pub commits: u64,
    pub drains: u64,
    pub nodes_flushed: u64,
    /// Dirty nodes superseded before their drain and never written.
    pub recycled: u64,
    pub reclaimed: u64,
    pub max_queued_mvs: usize,
    pub max_active_epochs: usize,
    pub max_reclaim_queue: usize,
    pub free_blocks: usize,
    pub pending_nodes: usize,
    pub queued_mvs: usize,
    pub active_epochs: usize,
    /// Node count per tree level, root first.
    pub levels: Vec<usize>,
    pub kv: KvStats,
}

/// An offset waiting for readers to move past it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reclaim {
    pub offset: BlockOffset,
    pub retired_at: Epoch,
}

pub(crate) enum Command {
    Access {
        reply: oneshot::Sender<(Epoch, Arc<Node>)>,
    },
    Release {
        epoch: Epoch,
        stales: Vec<Stale>,
        returned: Vec<BlockOffset>,
        reply: oneshot::Sender<()>,
    },
    CacheLookup {
        offset: BlockOffset,
        reply: oneshot::Sender<Option<Arc<Node>>>,
    },
    CacheInsert {
        node: Arc<Node>,
    },
    PopFreelist {
        reply: oneshot::Sender<Result<BlockOffset, StoreError>>,
    },
    Commit {
        mv: Mv,
        reply: oneshot::Sender<Result<Epoch, StoreError>>,
    },
    Drain {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Check {
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Stats {
        reply: oneshot::Sender<Result<StoreStats, StoreError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Handle on the MVCC actor.
#[derive(Clone)]
pub struct Mvcc {
    tx: mpsc::Sender<Command>,
}

impl Mvcc {
    /// Start the actor thread over `state`.
    pub(crate) fn spawn(state: WriteState) -> Result<(Self, JoinHandle<()>), StoreError> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name("cowtree-mvcc".to_string())
            .spawn(move || state.run(rx))?;
        Ok((Self { tx }, handle))
    }

    /// Begin a transaction: returns its epoch and the current root.
    pub fn access(&self) -> (Epoch, Arc<Node>) {
        self.request(|reply| Command::Access { reply })
    }

    /// End a transaction started by [`Mvcc::access`].
    ///
    /// `stales` are the offsets superseded by the changeset the caller just
    /// committed; `returned` are popped offsets it did not use.
    pub fn release(&self, epoch: Epoch, stales: Vec<Stale>, returned: Vec<BlockOffset>) {
        self.request(|reply| Command::Release {
            epoch,
            stales,
            returned,
            reply,
        });
    }

    /// Release from a destructor: never panics if the actor is gone.
    pub fn try_release(&self, epoch: Epoch) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Release {
            epoch,
            stales: Vec::new(),
            returned: Vec::new(),
            reply,
        };
        if self.tx.blocking_send(command).is_ok() {
            let _ = rx.blocking_recv();
        }
    }

    /// Look `offset` up in the pending commit set, then the cache.
    #[must_use]
    pub fn cache_lookup(&self, offset: BlockOffset) -> Option<Arc<Node>> {
        self.request(|reply| Command::CacheLookup { offset, reply })
    }

    /// Offer a node read from disk to the cache.
    pub fn cache_insert(&self, node: Arc<Node>) {
        self.send(Command::CacheInsert { node });
    }

    /// Allocate one block, extending the file if free space is low.
    pub fn pop_freelist(&self) -> Result<BlockOffset, StoreError> {
        self.request(|reply| Command::PopFreelist { reply })
    }

    /// Queue a changeset and make its root current. Returns its timestamp.
    pub fn commit(&self, mv: Mv) -> Result<Epoch, StoreError> {
        self.request(|reply| Command::Commit { mv, reply })
    }

    /// Drain every queued changeset and persist the free list and head.
    pub fn drain(&self) -> Result<(), StoreError> {
        self.request(|reply| Command::Drain { reply })
    }

    pub fn check(&self) -> Result<bool, StoreError> {
        self.request(|reply| Command::Check { reply })
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.request(|reply| Command::Stats { reply })
    }

    /// Drain everything and stop the actor.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.request(|reply| Command::Shutdown { reply })
    }

    fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply));
        match rx.blocking_recv() {
            Ok(value) => value,
            Err(_) => panic!("mvcc actor terminated"),
        }
    }

    fn send(&self, command: Command) {
        if self.tx.blocking_send(command).is_err() {
            panic!("mvcc actor terminated");
        }
    }
}

/// State owned by the actor thread.
pub(crate) struct WriteState {
    pub(crate) file: Arc<IndexFile>,
    pub(crate) kv: KvLog,
    pub(crate) layout: Layout,
    pub(crate) append_ratio: f64,
    pub(crate) drain_rate: usize,
    pub(crate) sync: bool,
    pub(crate) head: Head,
    /// The head differs from what is on disk.
    pub(crate) head_dirty: bool,
    /// Timestamp of the last changeset known durable.
    pub(crate) published: Epoch,
    pub(crate) freelist: FreeList,
    pub(crate) cache: NodeCache,
    pub(crate) root: Arc<Node>,
    pub(crate) pending: HashMap<BlockOffset, Arc<Node>>,
    pub(crate) queue: VecDeque<Mv>,
    pub(crate) epochs: BTreeSet<Epoch>,
    pub(crate) reclaims: VecDeque<Reclaim>,
    pub(crate) clock: Epoch,
    pub(crate) last_commit: Epoch,
    pub(crate) stats: StoreStats,
}

impl WriteState {
    /// Initialise a fresh index file: seed the free list, write an empty
    /// root leaf, then persist free list and head.
    pub(crate) fn create(file: Arc<IndexFile>, kv: KvLog, config: &StoreConfig) -> Result<Self, StoreError> {
        let layout = *file.layout();
        let mut freelist = FreeList::new(&layout);
        let blocks = file.extend(freelist.extension_size(config.append_ratio))?;
        let appended = blocks.len();
        freelist.add(blocks);
        let Some(root_offset) = freelist.pop() else {
            panic!("fresh free list is empty");
        };

        let mut root = Node::empty_leaf(root_offset);
        root.set_dirty(false);
        file.write_node(&root)?;

        let mut head = Head::new(&layout, root_offset);
        head.freelist_crc = freelist.flush(&file)?;
        head.flush(&file)?;
        file.sync()?;

        let mut state = Self::assemble(file, kv, config, head, freelist, root);
        state.stats.extensions = 1;
        state.stats.appended_blocks = appended as u64;
        Ok(state)
    }

    /// Load head, free list and root of an existing index file.
    pub(crate) fn open(file: Arc<IndexFile>, kv: KvLog, config: &StoreConfig) -> Result<Self, StoreError> {
        let head = Head::load(&file)?;
        let freelist = FreeList::load(&file, head.freelist_crc)?;
        let root = file.read_node(head.root)?;
        let mut state = Self::assemble(file, kv, config, head, freelist, root);
        if state.head.partial_freelist {
            state.recover_free_blocks()?;
        }
        Ok(state)
    }

    /// Rebuild the free list as every block the published tree does not
    /// reach.
    fn recover_free_blocks(&mut self) -> Result<(), StoreError> {
        let mut reachable = HashSet::new();
        let mut stack = vec![self.head.root];
        while let Some(offset) = stack.pop() {
            reachable.insert(offset);
            if let Node::Internal(internal) = &*self.fetch(offset)? {
                stack.extend(internal.children.iter().copied());
            }
        }
        let free: Vec<_> = self
            .file
            .block_offsets()
            .filter(|offset| !reachable.contains(offset))
            .collect();
        tracing::info!(free = free.len(), reachable = reachable.len(), "recomputed free blocks");
        self.freelist.reset(free);
        Ok(())
    }

    fn assemble(
        file: Arc<IndexFile>,
        kv: KvLog,
        config: &StoreConfig,
        head: Head,
        freelist: FreeList,
        root: Node,
    ) -> Self {
        let layout = *file.layout();
        let mut cache = NodeCache::new(config.max_leaf_cache_entries, !config.no_cache);
        let root = Arc::new(root);
        cache.insert(Arc::clone(&root));
        Self {
            file,
            kv,
            layout,
            append_ratio: config.append_ratio,
            drain_rate: config.drain_rate,
            sync: config.sync,
            head,
            head_dirty: false,
            published: head.timestamp,
            freelist,
            cache,
            root,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            epochs: BTreeSet::new(),
            reclaims: VecDeque::new(),
            clock: head.timestamp,
            last_commit: head.timestamp,
            stats: StoreStats::default(),
        }
    }

    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Access { reply } => {
                    let _ = reply.send(self.access());
                }
                Command::Release {
                    epoch,
                    stales,
                    returned,
                    reply,
                } => {
                    self.release(epoch, stales, returned);
                    let _ = reply.send(());
                }
                Command::CacheLookup { offset, reply } => {
                    let _ = reply.send(self.cache_lookup(offset));
                }
                Command::CacheInsert { node } => self.cache_insert(node),
                Command::PopFreelist { reply } => {
                    let _ = reply.send(self.pop_freelist());
                }
                Command::Commit { mv, reply } => {
                    let _ = reply.send(self.commit(mv));
                }
                Command::Drain { reply } => {
                    let _ = reply.send(self.drain_all());
                }
                Command::Check { reply } => {
                    let _ = reply.send(self.check());
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.collect_stats());
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(self.shutdown());
                    break;
                }
            }
        }
    }

    #[must_use]
    pub(crate) fn get_root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    pub(crate) fn set_root(&mut self, root: Arc<Node>) {
        self.root = root;
    }

    fn access(&mut self) -> (Epoch, Arc<Node>) {
        self.clock += 1;
        self.epochs.insert(self.clock);
        self.stats.max_active_epochs = self.stats.max_active_epochs.max(self.epochs.len());
        (self.clock, self.get_root())
    }

    fn release(&mut self, epoch: Epoch, stales: Vec<Stale>, returned: Vec<BlockOffset>) {
        if !self.epochs.remove(&epoch) {
            tracing::error!(epoch, "release of unknown epoch");
            panic!("release of unknown epoch {epoch}");
        }
        if !stales.is_empty() {
            if self.last_commit <= epoch {
                tracing::error!(epoch, last_commit = self.last_commit, "stales without a commit");
                panic!("epoch {epoch} released stale offsets without committing");
            }
            let retired_at = self.last_commit;
            self.reclaims.extend(stales.into_iter().map(|stale| Reclaim {
                offset: stale.offset,
                retired_at,
            }));
            self.stats.max_reclaim_queue = self.stats.max_reclaim_queue.max(self.reclaims.len());
        }
        self.freelist.add(returned);
        self.reclaim();
    }

    fn cache_lookup(&mut self, offset: BlockOffset) -> Option<Arc<Node>> {
        if let Some(node) = self.pending.get(&offset) {
            return Some(Arc::clone(node));
        }
        self.cache.get(offset)
    }

    fn cache_insert(&mut self, node: Arc<Node>) {
        if !self.pending.contains_key(&node.offset()) {
            self.cache.insert(node);
        }
    }

    fn pop_freelist(&mut self) -> Result<BlockOffset, StoreError> {
        if self.freelist.is_critical() {
            self.reclaim();
        }
        if self.freelist.is_critical() {
            self.extend()?;
        }
        let Some(offset) = self.freelist.pop() else {
            tracing::error!("free list exhausted after extension");
            panic!("free list exhausted after extension");
        };
        self.stats.freelist_pops += 1;
        Ok(offset)
    }

    fn commit(&mut self, mut mv: Mv) -> Result<Epoch, StoreError> {
        for stale in &mv.stales {
            if stale.dirty && !self.pending.contains_key(&stale.offset) {
                tracing::error!(offset = stale.offset, "dirty stale missing from pending");
                panic!("dirty stale node {} missing from the pending commit set", stale.offset);
            }
        }
        let Some(root) = mv.commits.iter().find(|node| node.offset() == mv.root) else {
            panic!("changeset root {} is not among its commits", mv.root);
        };
        let root = Arc::clone(root);

        self.clock += 1;
        mv.timestamp = self.clock;
        for node in &mv.commits {
            if self.pending.insert(node.offset(), Arc::clone(node)).is_some() {
                tracing::error!(offset = node.offset(), "offset committed twice");
                panic!("offset {} committed twice", node.offset());
            }
        }
        self.set_root(root);
        self.last_commit = mv.timestamp;
        self.queue.push_back(mv);
        self.stats.commits += 1;
        self.stats.max_queued_mvs = self.stats.max_queued_mvs.max(self.queue.len());

        if self.queue.len() > self.drain_rate {
            let limit = self.epochs.first().copied();
            self.drain_until(limit)?;
        }
        Ok(self.last_commit)
    }

    /// Return reclaimable offsets to the free list.
    pub(crate) fn reclaim(&mut self) {
        let published = self.published;
        let oldest = self.epochs.first().copied();
        let mut freed = Vec::new();
        self.reclaims.retain(|entry| {
            let ready = entry.retired_at <= published && oldest.is_none_or(|epoch| entry.retired_at < epoch);
            if ready {
                freed.push(entry.offset);
            }
            !ready
        });
        if freed.is_empty() {
            return;
        }

        for offset in &freed {
            if self.pending.contains_key(offset) {
                tracing::error!(offset, "reclaiming an undrained node");
                panic!("reclaiming undrained node {offset}");
            }
            self.cache.evict(*offset);
        }
        self.stats.reclaimed += freed.len() as u64;
        self.freelist.add(freed);
    }

    /// Append zeroed blocks until the free list reaches its target size.
    fn extend(&mut self) -> Result<(), StoreError> {
        let count = self.freelist.extension_size(self.append_ratio);
        if count == 0 {
            return Ok(());
        }
        let blocks = self.file.extend(count)?;
        tracing::debug!(count, len = self.file.len(), "extended index file");
        self.freelist.add(blocks);
        self.stats.extensions += 1;
        self.stats.appended_blocks += count as u64;
        Ok(())
    }

    /// Pending node, cached node, or a read from disk.
    pub(crate) fn fetch(&mut self, offset: BlockOffset) -> Result<Arc<Node>, StoreError> {
        if let Some(node) = self.cache_lookup(offset) {
            return Ok(node);
        }
        Ok(Arc::new(self.file.read_node(offset)?))
    }

    fn collect_stats(&mut self) -> Result<StoreStats, StoreError> {
        let mut levels = Vec::new();
        let mut level = vec![self.get_root()];
        while !level.is_empty() {
            levels.push(level.len());
            let mut next = Vec::new();
            for node in &level {
                if let Node::Internal(internal) = &**node {
                    for child in &internal.children {
                        next.push(self.fetch(*child)?);
                    }
                }
            }
            level = next;
        }

        Ok(StoreStats {
            cache: self.cache.stats(),
            cached_nodes: self.cache.len(),
            free_blocks: self.freelist.len(),
            pending_nodes: self.pending.len(),
            queued_mvs: self.queue.len(),
            active_epochs: self.epochs.len(),
            levels,
            kv: self.kv.stats(),
            ..self.stats.clone()
        })
    }

    fn shutdown(&mut self) -> Result<(), StoreError> {
        self.drain_all()?;
        if !self.queue.is_empty()
            || !self.pending.is_empty()
            || !self.epochs.is_empty()
            || !self.reclaims.is_empty()
        {
            tracing::error!(
                queued = self.queue.len(),
                pending = self.pending.len(),
                epochs = self.epochs.len(),
                reclaims = self.reclaims.len(),
                "outstanding work at shutdown"
            );
            panic!("store shut down with outstanding changesets, readers or reclaims");
        }
        self.file.sync()?;
        tracing::debug!(drains = self.stats.drains, reclaimed = self.stats.reclaimed, "mvcc actor stopped");
        Ok(())
    }
}
