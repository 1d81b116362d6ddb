//! The buffer cache.
//!
//! Every resident block lives in an arena slot holding its contents,
//! its lock state and a FIFO queue of waiters. All of that is guarded
//! by one mutex which is never held across disk I/O: misses start an
//! asynchronous read and park the caller on a [`OneShot`], and the
//! read's completion installs the contents and grants the queue.
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use fnv::FnvHashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::{
    Access, Account, BatchOp, BlockId, CacheObserver, CacheStats, Config,
    Error, GlobalError, LogSerializer, OneShot, OneShotFiller, Result,
    flusher::Flusher, lru::Lru,
};

struct Waiter {
    access: Access,
    filler: OneShotFiller<Result<BlockHandle>>,
}

struct Entry {
    block_id: BlockId,
    data: Arc<RwLock<Vec<u8>>>,
    // the dirty sequence of the last write release, if unflushed
    dirty: Option<u64>,
    readers: usize,
    writer: bool,
    loading: bool,
    deleted: bool,
    waiters: VecDeque<Waiter>,
}

impl Entry {
    fn new(block_id: BlockId, loading: bool) -> Entry {
        Entry {
            block_id,
            data: Arc::new(RwLock::new(vec![])),
            dirty: None,
            readers: 0,
            writer: false,
            loading,
            deleted: false,
            waiters: VecDeque::new(),
        }
    }

    fn can_grant(&self, access: Access) -> bool {
        if self.loading || self.writer {
            return false;
        }
        match access {
            Access::Read => true,
            Access::Write => self.readers == 0,
        }
    }

    fn ungrant(&mut self, access: Access) {
        match access {
            Access::Read => {
                assert!(self.readers > 0);
                self.readers -= 1;
            }
            Access::Write => {
                assert!(self.writer);
                self.writer = false;
            }
        }
    }

    fn is_evictable(&self) -> bool {
        self.dirty.is_none()
            && self.readers == 0
            && !self.writer
            && !self.loading
            && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct State {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    by_id: FnvHashMap<BlockId, usize>,
    lru: Lru,
    dirty_seq: u64,
}

impl State {
    fn insert(&mut self, entry: Entry) -> usize {
        let block_id = entry.block_id;
        let idx = if let Some(idx) = self.free.pop() {
            self.entries[idx] = Some(entry);
            idx
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        };
        let previous = self.by_id.insert(block_id, idx);
        assert!(previous.is_none(), "block {} is already resident", block_id);
        self.lru.touch(idx);
        idx
    }

    fn remove(&mut self, idx: usize) -> Entry {
        let entry = self.entries[idx]
            .take()
            .expect("removed a vacant cache slot");
        self.by_id.remove(&entry.block_id);
        self.lru.remove(idx);
        self.free.push(idx);
        entry
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.entries[idx].as_mut().expect("cache index points at a vacant slot")
    }

    fn next_dirty_seq(&mut self) -> u64 {
        self.dirty_seq += 1;
        self.dirty_seq
    }
}

/// A block handed to a flush, along with the dirty sequence it was
/// flushed at.
struct Flushed {
    idx: usize,
    block_id: BlockId,
    seq: u64,
}

/// The state shared by a [`BlockCache`], its handles, its flusher and
/// the completions of its reads.
pub(crate) struct CacheCore {
    pub(crate) config: Config,
    pub(crate) serializer: LogSerializer,
    state: Mutex<State>,
    observer: Arc<dyn CacheObserver>,
    global_error: GlobalError,
    flush_mu: Mutex<()>,
}

impl CacheCore {
    fn handle(self: &Arc<Self>, entry: &mut Entry, access: Access) -> BlockHandle {
        let guard = match access {
            Access::Read => {
                entry.readers += 1;
                Guard::Read(entry.data.read_arc())
            }
            Access::Write => {
                entry.writer = true;
                Guard::Write(entry.data.write_arc())
            }
        };
        BlockHandle {
            block_id: entry.block_id,
            access,
            guard: Some(guard),
            cache: Some(self.clone()),
            deleted: false,
        }
    }

    /// Hands the entry to queued waiters in arrival order until the
    /// first one that has to keep waiting.
    fn grant_waiters(self: &Arc<Self>, entry: &mut Entry) {
        while let Some(waiter) = entry.waiters.front() {
            if waiter.filler.is_abandoned() {
                entry.waiters.pop_front();
                continue;
            }
            if entry.deleted {
                if let Some(waiter) = entry.waiters.pop_front() {
                    waiter.filler.fill(Err(Error::NotFound(entry.block_id)));
                }
                continue;
            }
            if !entry.can_grant(waiter.access) {
                break;
            }

            let Some(Waiter { access, filler }) = entry.waiters.pop_front() else {
                break;
            };
            let handle = self.handle(entry, access);
            if let Err(Ok(handle)) = filler.try_fill(Ok(handle)) {
                log::trace!("acquire of block {} was abandoned", entry.block_id);
                handle.disarm();
                entry.ungrant(access);
            }
        }
    }

    fn acquire(
        self: &Arc<Self>,
        block_id: BlockId,
        access: Access,
        account: &Account,
    ) -> PendingAcquire {
        if let Err(e) = self.global_error.check() {
            return PendingAcquire::ready(Err(e));
        }

        let mut state = self.state.lock();

        if let Some(&idx) = state.by_id.get(&block_id) {
            state.lru.touch(idx);
            let entry = state.entry_mut(idx);
            if entry.deleted {
                return PendingAcquire::ready(Err(Error::NotFound(block_id)));
            }

            self.observer.hit(block_id);
            if entry.waiters.is_empty() && entry.can_grant(access) {
                let handle = self.handle(entry, access);
                return PendingAcquire::ready(Ok(handle));
            }

            log::trace!("queueing {:?} acquire of block {}", access, block_id);
            let (filler, inner) = OneShot::pair();
            entry.waiters.push_back(Waiter { access, filler });
            return PendingAcquire { inner };
        }

        if !self.serializer.contains(block_id) {
            return PendingAcquire::ready(Err(Error::NotFound(block_id)));
        }

        let (filler, inner) = OneShot::pair();
        let mut entry = Entry::new(block_id, true);
        entry.waiters.push_back(Waiter { access, filler });
        let idx = state.insert(entry);

        self.observer.miss(block_id);
        self.observer.resident(state.by_id.len());
        drop(state);

        log::trace!("reading block {} into cache slot {}", block_id, idx);
        let cache = Arc::downgrade(self);
        self.serializer.read_async(block_id, account, move |res| {
            if let Some(cache) = cache.upgrade() {
                cache.finish_load(idx, block_id, res);
            }
        });

        PendingAcquire { inner }
    }

    fn finish_load(
        self: &Arc<Self>,
        idx: usize,
        block_id: BlockId,
        res: Result<Vec<u8>>,
    ) {
        let mut state = self.state.lock();

        let is_loading = matches!(
            state.entries.get(idx),
            Some(Some(entry)) if entry.block_id == block_id && entry.loading
        );
        assert!(is_loading, "read completed for block {} that is not loading", block_id);

        match res {
            Ok(data) => {
                let entry = state.entry_mut(idx);
                *entry.data.write() = data;
                entry.loading = false;
                self.grant_waiters(entry);
                self.evict(&mut state);
            }
            Err(e) => {
                log::warn!("failed to read block {} into the cache: {}", block_id, e);
                let entry = state.remove(idx);
                self.observer.resident(state.by_id.len());
                drop(state);

                for waiter in entry.waiters {
                    waiter.filler.fill(Err(e.clone()));
                }
            }
        }
    }

    fn allocate(self: &Arc<Self>) -> Result<BlockHandle> {
        self.global_error.check()?;
        let block_id = self.serializer.allocate_block_id()?;

        let mut state = self.state.lock();
        let idx = state.insert(Entry::new(block_id, false));
        let handle = self.handle(state.entry_mut(idx), Access::Write);
        self.observer.resident(state.by_id.len());
        self.evict(&mut state);

        log::trace!("allocated block {} in cache slot {}", block_id, idx);
        Ok(handle)
    }

    fn release(self: &Arc<Self>, block_id: BlockId, access: Access, deleted: bool) {
        let mut state = self.state.lock();
        let Some(&idx) = state.by_id.get(&block_id) else {
            panic!("released block {} which is not resident", block_id);
        };

        let seq = match access {
            Access::Write => Some(state.next_dirty_seq()),
            Access::Read => None,
        };

        let entry = state.entry_mut(idx);
        entry.ungrant(access);
        if access == Access::Write {
            entry.dirty = seq;
            entry.deleted |= deleted;
        }

        self.grant_waiters(entry);
        self.evict(&mut state);
    }

    /// Drops clean, unreferenced blocks in least recently used order
    /// until the resident blocks fit into the configured capacity.
    fn evict(&self, state: &mut State) {
        let limit = self.config.cache_capacity_bytes / self.config.block_size;
        let excess = state.by_id.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }

        let victims: Vec<usize> = state
            .lru
            .iter_lru()
            .filter(|idx| {
                state.entries[*idx].as_ref().map(Entry::is_evictable).unwrap_or(false)
            })
            .take(excess)
            .collect();

        if victims.is_empty() {
            return;
        }

        for idx in victims {
            let entry = state.remove(idx);
            log::trace!("evicting block {}", entry.block_id);
            self.observer.evicted(entry.block_id);
        }
        self.observer.resident(state.by_id.len());
    }

    /// Writes up to `limit` dirty blocks, longest dirty first, as one
    /// batch. Blocks that are write-locked or still loading are left
    /// for the next flush. Returns the number of blocks written.
    pub(crate) fn flush(&self, limit: Option<usize>) -> Result<usize> {
        let _flushing = self.flush_mu.lock();
        self.global_error.check()?;

        let max_payload = self.config.max_payload();
        let mut oversized = None;
        let mut ops = vec![];
        let mut flushed = vec![];

        {
            let mut state = self.state.lock();

            let mut dirty: Vec<(u64, usize)> = state
                .entries
                .iter()
                .enumerate()
                .filter_map(|(idx, entry)| {
                    let entry = entry.as_ref()?;
                    let seq = entry.dirty?;
                    (!entry.writer && !entry.loading).then_some((seq, idx))
                })
                .collect();
            dirty.sort_unstable();
            if let Some(limit) = limit {
                dirty.truncate(limit);
            }

            for (seq, idx) in dirty {
                let entry = state.entry_mut(idx);
                let block_id = entry.block_id;

                if entry.deleted {
                    // blocks that were never written only give back their id
                    if self.serializer.contains(block_id) {
                        ops.push(BatchOp::Delete(block_id));
                    }
                } else {
                    let data = entry.data.read();
                    if data.len() > max_payload {
                        log::error!(
                            "block {} holds {} bytes, more than the {} that fit \
                            into a slot, and cannot be flushed",
                            block_id,
                            data.len(),
                            max_payload
                        );
                        if oversized.is_none() {
                            oversized = Some(Error::Unsupported(format!(
                                "block {} holds {} bytes but at most {} fit \
                                into a slot",
                                block_id,
                                data.len(),
                                max_payload
                            )));
                        }
                        continue;
                    }
                    ops.push(BatchOp::Write(block_id, data.clone()));
                }

                flushed.push(Flushed { idx, block_id, seq });
            }
        }

        let written = ops.len();
        if !ops.is_empty() {
            self.write_with_retries(ops)?;
        }

        let mut state = self.state.lock();
        for Flushed { idx, block_id, seq } in flushed {
            let Some(entry) = state.entries[idx].as_mut() else {
                continue;
            };
            if entry.block_id != block_id || entry.dirty != Some(seq) {
                log::trace!("block {} was dirtied again during flush", block_id);
                continue;
            }
            entry.dirty = None;

            if entry.deleted {
                let entry = state.remove(idx);
                assert!(entry.readers == 0 && !entry.writer);
                for waiter in entry.waiters {
                    waiter.filler.fill(Err(Error::NotFound(block_id)));
                }
                // the id may only be handed out again once nothing
                // resident claims it
                self.serializer.release_block_id(block_id);
            }
        }

        if written > 0 {
            log::debug!("flushed {} blocks", written);
            self.observer.flushed(written);
        }
        self.observer.resident(state.by_id.len());
        self.evict(&mut state);
        drop(state);

        match oversized {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn write_with_retries(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.serializer.write_batch_keeping_ids(ops.clone()) {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < self.config.flush_retries
                        && e != Error::ShutDown
                        && !self.global_error.is_set() =>
                {
                    attempt += 1;
                    log::warn!(
                        "flush of {} blocks failed, retry {} of {}: {}",
                        ops.len(),
                        attempt,
                        self.config.flush_retries,
                        e
                    );
                }
                Err(e) => {
                    if e != Error::ShutDown {
                        self.global_error.set(&e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub(crate) fn checkpoint(&self) -> Result<()> {
        self.flush(None)?;
        self.serializer.checkpoint()
    }
}

enum Guard {
    Read(ArcRwLockReadGuard<RawRwLock, Vec<u8>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Vec<u8>>),
}

/// Access to one cached block, held until dropped.
///
/// A handle acquired with [`Access::Write`] can modify the block with
/// [`BlockHandle::data_mut`], and marks it dirty when released.
pub struct BlockHandle {
    block_id: BlockId,
    access: Access,
    guard: Option<Guard>,
    cache: Option<Arc<CacheCore>>,
    deleted: bool,
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("block_id", &self.block_id)
            .field("access", &self.access)
            .field("len", &self.len())
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl BlockHandle {
    /// The id of the held block.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The mode this handle was acquired in.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Mutable access to the block contents.
    ///
    /// # Panics
    ///
    /// Panics if the handle was acquired for reading.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.guard {
            Some(Guard::Write(guard)) => &mut **guard,
            _ => panic!("block {} is not held for writing", self.block_id),
        }
    }

    /// Deletes the block once this handle is released. Later acquires
    /// fail with [`Error::NotFound`], and the next flush removes the
    /// block from the log.
    ///
    /// # Panics
    ///
    /// Panics if the handle was acquired for reading.
    pub fn mark_deleted(&mut self) {
        assert_eq!(
            self.access,
            Access::Write,
            "block {} must be held for writing to be deleted",
            self.block_id
        );
        self.deleted = true;
    }

    // gives up the lock without going through the cache, for grants
    // that nobody was waiting for anymore
    fn disarm(mut self) {
        self.guard = None;
        self.cache = None;
    }
}

impl Deref for BlockHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.guard {
            Some(Guard::Read(guard)) => &guard[..],
            Some(Guard::Write(guard)) => &guard[..],
            None => &[],
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        // the lock must be free before the cache grants it again
        drop(self.guard.take());
        if let Some(cache) = self.cache.take() {
            cache.release(self.block_id, self.access, self.deleted);
        }
    }
}

/// An acquire that may still be waiting for the block's lock or for
/// its contents to be read.
///
/// Call [`PendingAcquire::wait`] to block on it, or `.await` it.
/// Dropping it gives up the acquire.
#[derive(Debug)]
pub struct PendingAcquire {
    inner: OneShot<Result<BlockHandle>>,
}

impl PendingAcquire {
    fn ready(res: Result<BlockHandle>) -> PendingAcquire {
        PendingAcquire { inner: OneShot::ready(res) }
    }

    /// Blocks until the block is held.
    pub fn wait(self) -> Result<BlockHandle> {
        self.inner.wait().unwrap_or(Err(Error::ShutDown))
    }

    /// Returns `true` if [`PendingAcquire::wait`] would not block.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

impl Future for PendingAcquire {
    type Output = Result<BlockHandle>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::ShutDown)))
    }
}

/// A buffer cache over a [`LogSerializer`].
///
/// Blocks are locked with many readers or one writer at a time, and
/// waiters are served strictly in the order they arrived. Dirty blocks
/// are written back by [`BlockCache::flush`] and by a background
/// flusher thread when [`Config::flush_every_ms`] is set.
///
/// Dropping the cache flushes it and shuts the serializer down.
pub struct BlockCache {
    core: Arc<CacheCore>,
    flusher: Option<Flusher>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("resident_blocks", &self.resident_blocks())
            .field("serializer", &self.core.serializer)
            .finish()
    }
}

impl BlockCache {
    /// Opens the store described by `config`, recovering it if it
    /// already exists.
    pub fn open(config: Config) -> Result<BlockCache> {
        BlockCache::open_with_observer(config, Arc::new(CacheStats::default()))
    }

    /// Like [`BlockCache::open`], reporting cache events to `observer`.
    pub fn open_with_observer(
        config: Config,
        observer: Arc<dyn CacheObserver>,
    ) -> Result<BlockCache> {
        let serializer = LogSerializer::open(config.clone())?;
        let global_error = serializer.global_error();

        let core = Arc::new(CacheCore {
            config,
            serializer,
            state: Mutex::new(State::default()),
            observer,
            global_error,
            flush_mu: Mutex::new(()),
        });

        let flusher = match core.config.flush_every_ms {
            Some(flush_every_ms) => Some(Flusher::new(
                "logcache flusher".into(),
                core.clone(),
                flush_every_ms,
            )?),
            None => None,
        };

        Ok(BlockCache { core, flusher })
    }

    /// Requests the block in the given mode.
    pub fn acquire(&self, block_id: BlockId, access: Access) -> PendingAcquire {
        self.core.acquire(block_id, access, &Account::DEFAULT)
    }

    /// Like [`BlockCache::acquire`], charging a read-through to
    /// `account`.
    pub fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        account: &Account,
    ) -> PendingAcquire {
        self.core.acquire(block_id, access, account)
    }

    /// Blocks until the block is held for reading.
    pub fn read(&self, block_id: BlockId) -> Result<BlockHandle> {
        self.acquire(block_id, Access::Read).wait()
    }

    /// Blocks until the block is held for writing.
    pub fn write(&self, block_id: BlockId) -> Result<BlockHandle> {
        self.acquire(block_id, Access::Write).wait()
    }

    /// Creates a new, empty block and returns it held for writing.
    pub fn allocate(&self) -> Result<BlockHandle> {
        self.core.allocate()
    }

    /// Releases a handle. This is the same as dropping it.
    pub fn release(&self, handle: BlockHandle) {
        drop(handle);
    }

    /// Durably writes every dirty block that is not currently held for
    /// writing. Returns the number of blocks written.
    pub fn flush(&self) -> Result<usize> {
        self.core.flush(None)
    }

    /// Flushes and then writes a checkpoint of the block index, so the
    /// next open does not have to replay anything written before.
    pub fn checkpoint(&self) -> Result<()> {
        self.core.checkpoint()
    }

    /// Relocates live blocks out of sparsely used extents. Returns the
    /// number of blocks moved.
    pub fn collect_garbage(&self) -> Result<usize> {
        self.core.serializer.collect_garbage()
    }

    /// The serializer the cache writes to.
    pub fn serializer(&self) -> &LogSerializer {
        &self.core.serializer
    }

    /// The number of blocks currently resident.
    pub fn resident_blocks(&self) -> usize {
        self.core.state.lock().by_id.len()
    }

    /// The number of resident blocks with unflushed changes.
    pub fn dirty_blocks(&self) -> usize {
        self.core
            .state
            .lock()
            .entries
            .iter()
            .flatten()
            .filter(|entry| entry.dirty.is_some())
            .count()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        drop(self.flusher.take());

        if let Err(e) = self.core.flush(None) {
            log::error!("failed to flush the cache while dropping it: {}", e);
        }
        if let Err(e) = self.core.serializer.shutdown() {
            log::error!("failed to shut down the serializer: {}", e);
        }
    }
}
