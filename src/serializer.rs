//! The log-structured serializer.
//!
//! Blocks are never overwritten in place. Every write appends a new
//! record to the active extent, the in-memory block index is updated
//! to point at it, and the previous location becomes garbage. The
//! index is persisted by checkpoints: a compressed snapshot chain in
//! the log plus a metablock naming it. Recovery loads the newest
//! snapshot and replays the records written after it.
use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fault_injection::fallible;
use fnv::FnvHashSet;
use fs2::FileExt as _;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::{
    Account, BlockId, Config, Error, GlobalError, IoBackend, IoStats,
    Location, Lsn, Result, Spinlock,
    concurrency_control::CheckpointGate,
    extent::{ExtentManager, ExtentState, Tenant},
    header::StaticHeader,
    id_allocator::Allocator,
    metablock::{Metablock, MetablockManager},
    record::{self, RecordKind, Slot},
    snapshot::{self, BlockIndex, IndexEntry},
};

const LOCK_FILE: &str = "lock";

/// How many times a read chases a block that moved while it was being
/// read before giving up.
const READ_ATTEMPTS: usize = 8;

/// One element of a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Store a new version of the block.
    Write(BlockId, Vec<u8>),
    /// Delete the block. Its id becomes available for reuse once the
    /// batch commits.
    Delete(BlockId),
}

/// The lifecycle of a [`LogSerializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SerializerState {
    /// Opening the log file and checking its static header.
    Starting,
    /// Loading the index snapshot and replaying newer records.
    Replaying,
    /// Accepting reads and writes.
    Ready,
    /// Writing the final checkpoint.
    ShuttingDown,
    /// Shut down cleanly. Only reads of already indexed blocks
    /// still succeed.
    Closed,
}

/// Counters describing the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerStats {
    /// The current lifecycle state.
    pub state: SerializerState,
    /// The number of blocks in the index.
    pub blocks: usize,
    /// The lsn the next write will receive.
    pub next_lsn: Lsn,
    /// The generation of the newest metablock.
    pub metablock_generation: u64,
    /// Write batches completed since opening.
    pub batches: u64,
    /// Block records appended since opening, excluding relocations.
    pub records_written: u64,
    /// Checkpoints completed since opening.
    pub checkpoints: u64,
    /// Blocks moved by garbage collection since opening.
    pub relocated: u64,
    /// Extents opened since opening.
    pub extents_opened: u64,
    /// Extents that are currently closed but still hold live data.
    pub inactive_extents: usize,
    /// Extents waiting for the next metablock before reuse.
    pub pending_free_extents: usize,
    /// Counters of the disk backend.
    pub io: IoStats,
}

/// An append performed on behalf of a batch.
enum LogOp {
    Put { block_id: BlockId, data: Vec<u8>, relocated_from: Option<IndexEntry> },
    // `free_id` is false when the caller still owns the id and
    // releases it itself
    Delete { block_id: BlockId, free_id: bool },
}

struct Placed {
    op: LogOp,
    location: Location,
    lsn: Lsn,
}

/// State only touched while appending, committing or checkpointing.
struct Inner {
    extents: ExtentManager,
    metablocks: MetablockManager,
    next_lsn: Lsn,
    snapshot_chunks: Vec<Location>,
    batches_since_checkpoint: usize,
}

/// Batches commit their index updates in the order their lsns were
/// assigned, so a delete can never be overtaken by an older write.
struct CommitOrder {
    next: Mutex<Lsn>,
    cv: Condvar,
}

#[derive(Clone)]
struct ReadPath {
    index: Arc<Spinlock<BlockIndex>>,
    backend: Weak<IoBackend>,
    extent_size: usize,
    block_size: usize,
}

type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

impl ReadPath {
    fn lookup(&self, block_id: BlockId) -> Option<IndexEntry> {
        self.index.lock().get(&block_id).copied()
    }

    fn start(
        self,
        block_id: BlockId,
        account: Account,
        attempts_left: usize,
        callback: ReadCallback,
    ) {
        let Some(entry) = self.lookup(block_id) else {
            return callback(Err(Error::NotFound(block_id)));
        };
        let Some(backend) = self.backend.upgrade() else {
            return callback(Err(Error::ShutDown));
        };

        let at = entry.location;
        let offset = at.offset(self.extent_size, self.block_size);
        log::trace!("reading block {} from {}", block_id, at);

        let block_size = self.block_size;
        backend.submit_read(&account, offset, block_size, move |res| {
            let buf = match res {
                Ok(buf) => buf,
                Err(e) => return callback(Err(e.into())),
            };

            match record::decode(&buf) {
                Slot::Valid(record)
                    if record.kind == RecordKind::Data
                        && record.block_id == block_id
                        && record.lsn == entry.lsn =>
                {
                    callback(Ok(record.payload.to_vec()))
                }
                Slot::Corrupt => {
                    log::error!("block {} at {} failed its crc check", block_id, at);
                    callback(Err(Error::Corruption { at }))
                }
                _ if attempts_left > 0 && self.lookup(block_id) != Some(entry) => {
                    log::debug!("block {} moved away from {} during read", block_id, at);
                    self.start(block_id, account, attempts_left - 1, callback)
                }
                other => {
                    log::error!(
                        "expected block {} lsn {} at {} but found {:?}",
                        block_id,
                        entry.lsn,
                        at,
                        other
                    );
                    callback(Err(Error::Corruption { at }))
                }
            }
        });
    }
}

/// Maps logical blocks onto an append-only log of extents.
pub struct LogSerializer {
    config: Config,
    backend: Arc<IoBackend>,
    inner: Mutex<Inner>,
    index: Arc<Spinlock<BlockIndex>>,
    block_ids: Allocator,
    gate: CheckpointGate,
    commit_order: CommitOrder,
    state: Mutex<SerializerState>,
    global_error: GlobalError,
    batches: AtomicU64,
    records_written: AtomicU64,
    checkpoints: AtomicU64,
    relocated: AtomicU64,
    _directory_lock: fs::File,
}

impl std::fmt::Debug for LogSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSerializer")
            .field("path", &self.config.path)
            .field("stats", &self.stats())
            .finish()
    }
}

struct Recovered {
    index: BlockIndex,
    metablocks: MetablockManager,
    extents: ExtentManager,
    next_lsn: Lsn,
    snapshot_chunks: Vec<Location>,
}

impl LogSerializer {
    /// Opens the store at `config.path`, creating it if the log file
    /// does not exist yet. An existing store is recovered from its
    /// newest valid metablock plus every record written after it,
    /// and a fresh checkpoint is written before this returns.
    pub fn open(config: Config) -> Result<LogSerializer> {
        config.validate()?;
        log::debug!("opening LogSerializer at {:?}", config.path);

        if let Err(e) = fs::read_dir(&config.path) {
            if e.kind() == io::ErrorKind::NotFound {
                fallible!(fs::create_dir_all(&config.path));
            }
        }

        let mut lock_opts = fs::OpenOptions::new();
        lock_opts.create(true).read(true).write(true).truncate(false);
        let directory_lock =
            fallible!(lock_opts.open(config.path.join(LOCK_FILE)));
        fallible!(directory_lock.try_lock_exclusive());

        let data_path = config.data_path();
        let is_new = match fs::metadata(&data_path) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        // a new log file is fully initialized under a temporary name,
        // so a crash during creation never leaves a log file without
        // a metablock behind
        let tmp_path = data_path.with_extension("tmp");
        let mut file_opts = fs::OpenOptions::new();
        file_opts.read(true).write(true);
        if is_new {
            file_opts.create(true).truncate(true);
        }
        let file =
            fallible!(file_opts.open(if is_new { &tmp_path } else { &data_path }));
        let file_len = fallible!(file.metadata()).len();

        let backend = Arc::new(IoBackend::open(file, &config)?);

        let recovered = if is_new {
            log::info!("creating new store at {:?}", config.path);
            StaticHeader::create(&backend, &config)?;

            let mut metablocks = MetablockManager::new(&config);
            let mut metablock = Metablock { next_lsn: 1, ..Metablock::default() };
            metablocks.write(&backend, &mut metablock)?;

            fallible!(fs::rename(&tmp_path, &data_path));
            #[cfg(unix)]
            fallible!(fs::File::open(&config.path).and_then(|dir| dir.sync_all()));

            Recovered {
                index: BlockIndex::default(),
                metablocks,
                extents: ExtentManager::new(&config),
                next_lsn: 1,
                snapshot_chunks: vec![],
            }
        } else {
            StaticHeader::read_and_check(&backend, &config)?;
            log::debug!("replaying log at {:?}", config.path);
            recover(&backend, &config, file_len)?
        };

        let block_ids = Allocator::from_allocated(
            &recovered.index.keys().copied().collect::<FnvHashSet<_>>(),
        );

        let serializer = LogSerializer {
            backend,
            inner: Mutex::new(Inner {
                extents: recovered.extents,
                metablocks: recovered.metablocks,
                next_lsn: recovered.next_lsn,
                snapshot_chunks: recovered.snapshot_chunks,
                batches_since_checkpoint: 0,
            }),
            index: Arc::new(Spinlock::new(recovered.index)),
            block_ids,
            gate: CheckpointGate::default(),
            commit_order: CommitOrder {
                next: Mutex::new(recovered.next_lsn),
                cv: Condvar::new(),
            },
            state: Mutex::new(SerializerState::Replaying),
            global_error: GlobalError::default(),
            batches: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            relocated: AtomicU64::new(0),
            _directory_lock: directory_lock,
            config,
        };

        // the records replayed above only survive in their extents
        // until a metablock covers them
        serializer.checkpoint_inner()?;

        *serializer.state.lock() = SerializerState::Ready;
        log::info!(
            "LogSerializer at {:?} ready with {} blocks",
            serializer.config.path,
            serializer.index.lock().len()
        );

        Ok(serializer)
    }

    /// Returns the configuration this serializer was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SerializerState {
        *self.state.lock()
    }

    pub(crate) fn global_error(&self) -> GlobalError {
        self.global_error.clone()
    }

    fn check_ready(&self) -> Result<()> {
        self.global_error.check()?;
        match self.state() {
            SerializerState::Ready => Ok(()),
            _ => Err(Error::ShutDown),
        }
    }

    /// Reserves an identifier that is not used by any block. The
    /// lowest free identifier is handed out first.
    pub fn allocate_block_id(&self) -> Result<BlockId> {
        self.check_ready()?;
        let block_id = self.block_ids.allocate();
        log::trace!("allocated block id {}", block_id);
        Ok(block_id)
    }

    /// Returns an identifier obtained from
    /// [`LogSerializer::allocate_block_id`] that was never written.
    pub fn release_block_id(&self, block_id: BlockId) {
        if !self.index.lock().contains_key(&block_id) {
            self.block_ids.free(block_id);
        }
    }

    /// Returns `true` if the block has been written and not deleted.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.index.lock().contains_key(&block_id)
    }

    /// Where the current version of a block lives in the log, along
    /// with its lsn.
    pub fn location_of(&self, block_id: BlockId) -> Option<(Location, Lsn)> {
        self.index.lock().get(&block_id).map(|e| (e.location, e.lsn))
    }

    /// Reads the current contents of a block.
    pub fn read(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let (filler, future) = crate::OneShot::pair();
        self.read_async(block_id, &Account::DEFAULT, move |res| filler.fill(res));
        match future.wait() {
            Some(res) => res,
            None => Err(Error::ShutDown),
        }
    }

    /// Reads the current contents of a block, running `callback` on a
    /// disk thread once the read completes.
    pub fn read_async<F>(&self, block_id: BlockId, account: &Account, callback: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        if let Err(e) = self.global_error.check() {
            return callback(Err(e));
        }

        let read_path = ReadPath {
            index: self.index.clone(),
            backend: Arc::downgrade(&self.backend),
            extent_size: self.config.extent_size,
            block_size: self.config.block_size,
        };
        read_path.start(block_id, *account, READ_ATTEMPTS, Box::new(callback));
    }

    /// Durably applies a batch of writes and deletes. The operations
    /// are applied in order, and nothing in the batch is visible to
    /// readers until every record of it is durable.
    pub fn write_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        self.write_batch_with(batch, &Account::DEFAULT)
    }

    /// Like [`LogSerializer::write_batch`], with the disk writes
    /// charged to `account`.
    pub fn write_batch_with(
        &self,
        batch: Vec<BatchOp>,
        account: &Account,
    ) -> Result<()> {
        self.write_ops(batch, account, true)
    }

    /// Like [`LogSerializer::write_batch`], but the ids of deleted blocks
    /// stay reserved until [`LogSerializer::release_block_id`] is called.
    pub(crate) fn write_batch_keeping_ids(&self, batch: Vec<BatchOp>) -> Result<()> {
        self.write_ops(batch, &Account::DEFAULT, false)
    }

    fn write_ops(
        &self,
        batch: Vec<BatchOp>,
        account: &Account,
        free_deleted_ids: bool,
    ) -> Result<()> {
        self.check_ready()?;

        for op in &batch {
            if let BatchOp::Write(block_id, data) = op {
                if data.len() > self.config.max_payload() {
                    return Err(Error::Unsupported(format!(
                        "block {} has {} bytes but at most {} fit into a slot",
                        block_id,
                        data.len(),
                        self.config.max_payload()
                    )));
                }
            }
        }

        let n = batch.len() as u64;
        let ops = batch
            .into_iter()
            .map(|op| match op {
                BatchOp::Write(block_id, data) => {
                    LogOp::Put { block_id, data, relocated_from: None }
                }
                BatchOp::Delete(block_id) => {
                    LogOp::Delete { block_id, free_id: free_deleted_ids }
                }
            })
            .collect();

        let need_checkpoint = self.append(ops, account)?;
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(n, Ordering::Relaxed);

        if need_checkpoint {
            log::debug!("checkpoint interval reached");
            self.checkpoint()?;
        }

        Ok(())
    }

    /// Places, writes and commits a group of appends. Returns whether
    /// the checkpoint interval has been reached.
    ///
    /// A group whose records fail to become durable is not committed:
    /// its slots are returned as garbage and the index is untouched, so
    /// the caller may retry it.
    fn append(&self, ops: Vec<LogOp>, account: &Account) -> Result<bool> {
        if ops.is_empty() {
            return Ok(false);
        }

        let _protector = self.gate.batch();

        let (placed, first_lsn, end_lsn) = {
            let mut inner = self.inner.lock();
            let first_lsn = inner.next_lsn;
            let placed: Vec<Placed> = ops
                .into_iter()
                .map(|op| {
                    let (block_id, lsn) = match &op {
                        LogOp::Put { block_id, relocated_from: Some(from), .. } => {
                            (*block_id, from.lsn)
                        }
                        LogOp::Put { block_id, .. } | LogOp::Delete { block_id, .. } => {
                            let lsn = inner.next_lsn;
                            inner.next_lsn += 1;
                            (*block_id, lsn)
                        }
                    };
                    let location = inner.extents.allocate_slot(Tenant::Block(block_id));
                    Placed { op, location, lsn }
                })
                .collect();
            (placed, first_lsn, inner.next_lsn)
        };

        let writes: Vec<(u64, Vec<u8>)> = placed
            .iter()
            .map(|p| {
                let (kind, block_id, payload) = match &p.op {
                    LogOp::Put { block_id, data, .. } => {
                        (RecordKind::Data, *block_id, data.as_slice())
                    }
                    LogOp::Delete { block_id, .. } => {
                        (RecordKind::Delete, *block_id, &[][..])
                    }
                };
                let slot = record::encode(
                    kind,
                    block_id,
                    p.lsn,
                    payload,
                    self.config.block_size,
                );
                let offset = p
                    .location
                    .offset(self.config.extent_size, self.config.block_size);
                (offset, slot)
            })
            .collect();

        let io_res = self
            .backend
            .write_many(account, writes)
            .and_then(|_| self.backend.sync(account));

        // wait for every batch with smaller lsns to commit first
        let mut next_commit = self.commit_order.next.lock();
        while *next_commit != first_lsn && first_lsn != end_lsn {
            self.commit_order.cv.wait(&mut next_commit);
        }

        let ret = match io_res {
            Ok(()) => Ok(self.commit(placed)),
            Err(e) => {
                log::warn!(
                    "abandoning {} appends after a failed write: {}",
                    placed.len(),
                    e
                );
                let mut inner = self.inner.lock();
                for p in &placed {
                    inner.extents.mark_garbage(p.location);
                }
                Err(Error::from(e))
            }
        };

        if first_lsn != end_lsn {
            *next_commit = end_lsn;
            drop(next_commit);
            self.commit_order.cv.notify_all();
        }

        ret
    }

    fn commit(&self, placed: Vec<Placed>) -> bool {
        let mut inner = self.inner.lock();
        let mut index = self.index.lock();
        let mut relocated = 0;

        for Placed { op, location, lsn } in placed {
            match op {
                LogOp::Put { block_id, relocated_from: Some(from), .. } => {
                    if index.get(&block_id) == Some(&from) {
                        index.insert(block_id, IndexEntry { location, lsn });
                        inner.extents.mark_garbage(from.location);
                        relocated += 1;
                    } else {
                        log::trace!(
                            "block {} changed during relocation from {}",
                            block_id,
                            from.location
                        );
                        inner.extents.mark_garbage(location);
                    }
                }
                LogOp::Put { block_id, .. } => {
                    match index.get(&block_id).copied() {
                        Some(current) if current.lsn > lsn => {
                            inner.extents.mark_garbage(location);
                        }
                        current => {
                            index.insert(block_id, IndexEntry { location, lsn });
                            if let Some(old) = current {
                                inner.extents.mark_garbage(old.location);
                            }
                        }
                    }
                }
                LogOp::Delete { block_id, free_id } => {
                    inner.extents.mark_garbage(location);
                    match index.get(&block_id).copied() {
                        Some(current) if current.lsn < lsn => {
                            index.remove(&block_id);
                            inner.extents.mark_garbage(current.location);
                            if free_id {
                                self.block_ids.free(block_id);
                            }
                        }
                        Some(_) => {}
                        None => {
                            log::trace!("deleting block {} that does not exist", block_id);
                            if free_id {
                                self.block_ids.free(block_id);
                            }
                        }
                    }
                }
            }
        }

        self.relocated.fetch_add(relocated, Ordering::Relaxed);

        inner.batches_since_checkpoint += 1;
        inner.batches_since_checkpoint >= self.config.checkpoint_interval
    }

    /// Writes a snapshot of the block index and a metablock pointing
    /// at it. Waits for in-flight batches to commit first.
    pub fn checkpoint(&self) -> Result<()> {
        self.global_error.check()?;
        if self.state() == SerializerState::Closed {
            return Err(Error::ShutDown);
        }
        self.checkpoint_inner()
    }

    fn checkpoint_inner(&self) -> Result<()> {
        let _protector = self.gate.checkpoint();
        let mut inner = self.inner.lock();

        let res = self.checkpoint_locked(&mut inner);
        if let Err(e) = &res {
            self.global_error.set(e);
        }
        res
    }

    fn checkpoint_locked(&self, inner: &mut Inner) -> Result<()> {
        let snapshot = self.index.lock().clone();
        let last_lsn = inner.next_lsn - 1;

        let compressed = if snapshot.is_empty() {
            vec![]
        } else {
            snapshot::encode_index(&snapshot, self.config.zstd_compression_level)?
        };

        let n_chunks = snapshot::chunks_needed(compressed.len(), &self.config);
        let locations: Vec<Location> = (0..n_chunks)
            .map(|_| inner.extents.allocate_slot(Tenant::Index))
            .collect();

        let writes =
            snapshot::chain_writes(&compressed, &locations, last_lsn, &self.config);
        self.backend.write_many(&Account::DEFAULT, writes)?;
        self.backend.sync(&Account::DEFAULT)?;

        let mut metablock = Metablock {
            generation: 0,
            last_lsn,
            next_lsn: inner.next_lsn,
            index_head: locations.first().copied(),
            index_chunks: n_chunks as u64,
            index_len: compressed.len() as u64,
            active_extent: inner.extents.active_extent(),
        };
        inner.metablocks.write(&self.backend, &mut metablock)?;

        let released = inner.extents.metablock_persisted();
        let old_chain = std::mem::replace(&mut inner.snapshot_chunks, locations);
        for location in old_chain {
            inner.extents.mark_garbage(location);
        }
        inner.batches_since_checkpoint = 0;
        self.checkpoints.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "checkpoint generation {} covers {} blocks through lsn {} in {} \
            chunks, released {} extents",
            metablock.generation,
            snapshot.len(),
            last_lsn,
            n_chunks,
            released
        );

        Ok(())
    }

    /// Relocates the live blocks of sparsely used extents and frees
    /// them. Returns the number of blocks moved.
    pub fn collect_garbage(&self) -> Result<usize> {
        self.check_ready()?;

        let candidates =
            self.inner.lock().extents.gc_candidates(self.config.gc_threshold);
        if candidates.is_empty() {
            return Ok(0);
        }

        log::debug!("garbage collecting extents {:?}", candidates);
        let before = self.relocated.load(Ordering::Acquire);

        for extent in candidates {
            // writes and checkpoints running since the candidates were
            // chosen may have emptied, released or even reopened it
            let live = {
                let inner = self.inner.lock();
                if inner.extents.state(extent) != ExtentState::Inactive {
                    log::trace!("gc candidate extent {} changed state", extent);
                    continue;
                }
                inner.extents.live_blocks(extent)
            };

            let relocations: Vec<LogOp> = live
                .par_iter()
                .filter_map(|(location, block_id)| {
                    self.read_for_relocation(*location, *block_id).transpose()
                })
                .collect::<Result<Vec<LogOp>>>()?;

            self.append(relocations, &Account::MAINTENANCE)?;

            let mut inner = self.inner.lock();
            match inner.extents.state(extent) {
                ExtentState::Inactive if inner.extents.live_count(extent) == 0 => {
                    inner.extents.free_extent(extent);
                }
                ExtentState::Inactive => {
                    log::debug!("extent {} gained no space from relocation", extent);
                }
                _ => {}
            }
        }

        let relocated = self.relocated.load(Ordering::Acquire) - before;
        Ok(relocated as usize)
    }

    fn read_for_relocation(
        &self,
        location: Location,
        block_id: BlockId,
    ) -> Result<Option<LogOp>> {
        let Some(entry) = self.index.lock().get(&block_id).copied() else {
            return Ok(None);
        };
        if entry.location != location {
            return Ok(None);
        }

        let buf = self.backend.read_at(
            &Account::MAINTENANCE,
            location.offset(self.config.extent_size, self.config.block_size),
            self.config.block_size,
        )?;

        match record::decode(&buf) {
            Slot::Valid(record)
                if record.kind == RecordKind::Data
                    && record.block_id == block_id
                    && record.lsn == entry.lsn =>
            {
                Ok(Some(LogOp::Put {
                    block_id,
                    data: record.payload.to_vec(),
                    relocated_from: Some(entry),
                }))
            }
            _ => {
                log::error!("live block {} at {} failed to validate", block_id, location);
                Err(Error::Corruption { at: location })
            }
        }
    }

    /// Blocks until every completed write is durable.
    pub fn sync(&self) -> Result<()> {
        self.global_error.check()?;
        self.backend.sync(&Account::DEFAULT).map_err(|e| {
            let error = Error::from(e);
            self.global_error.set(&error);
            error
        })
    }

    /// Writes a final checkpoint and refuses further writes.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SerializerState::Closed | SerializerState::ShuttingDown => {
                    return Ok(());
                }
                _ => *state = SerializerState::ShuttingDown,
            }
        }
        log::debug!("shutting down LogSerializer at {:?}", self.config.path);

        let res = self.global_error.check().and_then(|_| self.checkpoint_inner());
        self.backend.quiesce();

        *self.state.lock() = SerializerState::Closed;
        log::info!("LogSerializer at {:?} shut down", self.config.path);
        res
    }

    /// Returns the backend performing this serializer's disk I/O.
    pub fn io_backend(&self) -> &IoBackend {
        &self.backend
    }

    /// Returns a snapshot of the serializer's counters.
    pub fn stats(&self) -> SerializerStats {
        let (next_lsn, generation, counts) = {
            let inner = self.inner.lock();
            (inner.next_lsn, inner.metablocks.generation(), inner.extents.counts())
        };

        SerializerStats {
            state: self.state(),
            blocks: self.index.lock().len(),
            next_lsn,
            metablock_generation: generation,
            batches: self.batches.load(Ordering::Acquire),
            records_written: self.records_written.load(Ordering::Acquire),
            checkpoints: self.checkpoints.load(Ordering::Acquire),
            relocated: self.relocated.load(Ordering::Acquire),
            extents_opened: counts.opened,
            inactive_extents: counts.inactive,
            pending_free_extents: counts.pending_free,
            io: self.backend.stats(),
        }
    }
}

impl Drop for LogSerializer {
    fn drop(&mut self) {
        if self.state() != SerializerState::Closed {
            log::debug!(
                "dropping LogSerializer at {:?} without shutdown, the next \
                open will replay the log",
                self.config.path
            );
        }
    }
}

/// A record found while scanning an extent during replay.
struct Replayed {
    lsn: Lsn,
    location: Location,
    block_id: BlockId,
    kind: RecordKind,
}

fn recover(
    backend: &IoBackend,
    config: &Config,
    file_len: u64,
) -> Result<Recovered> {
    let mut metablocks = MetablockManager::new(config);
    let Some(metablock) = metablocks.read_latest(backend, config)? else {
        return Err(Error::Unrecoverable(format!(
            "no valid metablock found in {:?}",
            config.data_path()
        )));
    };

    let (mut index, snapshot_chunks) = snapshot::read_chain(backend, config, &metablock)?;

    let file_extents = file_len.div_ceil(config.extent_size as u64);
    let reserved: FnvHashSet<u64> = crate::extent::reserved_extents().collect();
    let referenced: FnvHashSet<u64> = index
        .values()
        .map(|e| e.location.extent)
        .chain(snapshot_chunks.iter().map(|l| l.extent))
        .collect();

    let to_scan: Vec<u64> = (0..file_extents)
        .filter(|e| !reserved.contains(e))
        .filter(|e| !referenced.contains(e) || Some(*e) == metablock.active_extent)
        .collect();

    log::debug!(
        "replaying records after lsn {} from {} of {} extents",
        metablock.last_lsn,
        to_scan.len(),
        file_extents
    );

    let scanned: Vec<(Vec<Replayed>, usize)> = to_scan
        .par_iter()
        .map(|extent| scan_extent(backend, config, *extent, metablock.last_lsn))
        .collect::<Result<_>>()?;

    let torn: usize = scanned.iter().map(|(_, torn)| torn).sum();
    let mut replayed: Vec<Replayed> =
        scanned.into_iter().flat_map(|(records, _)| records).collect();
    replayed.par_sort_unstable_by_key(|r| (r.lsn, r.location));

    let mut max_lsn = metablock.last_lsn;
    let n_replayed = replayed.len();
    for Replayed { lsn, location, block_id, kind } in replayed {
        max_lsn = max_lsn.max(lsn);
        match kind {
            RecordKind::Data => {
                let newer = index.get(&block_id).map(|e| e.lsn < lsn).unwrap_or(true);
                if newer {
                    index.insert(block_id, IndexEntry { location, lsn });
                }
            }
            RecordKind::Delete => {
                if index.get(&block_id).map(|e| e.lsn < lsn).unwrap_or(false) {
                    index.remove(&block_id);
                }
            }
            RecordKind::Index => unreachable!("index records are not replayed"),
        }
    }

    let next_lsn = metablock.next_lsn.max(max_lsn + 1);

    log::info!(
        "recovered {} blocks from metablock generation {}, replayed {} \
        records, skipped {} torn slots, next lsn {}",
        index.len(),
        metablock.generation,
        n_replayed,
        torn,
        next_lsn
    );

    let live: Vec<(Location, Tenant)> = index
        .iter()
        .map(|(block_id, e)| (e.location, Tenant::Block(*block_id)))
        .chain(snapshot_chunks.iter().map(|l| (*l, Tenant::Index)))
        .collect();

    let extents = ExtentManager::recover(config, live, file_extents);

    Ok(Recovered { index, metablocks, extents, next_lsn, snapshot_chunks })
}

/// Returns the valid block records newer than `after_lsn`, and the
/// number of slots that failed validation.
fn scan_extent(
    backend: &IoBackend,
    config: &Config,
    extent: u64,
    after_lsn: Lsn,
) -> Result<(Vec<Replayed>, usize)> {
    let buf = backend.read_at(
        &Account::DEFAULT,
        extent * config.extent_size as u64,
        config.extent_size,
    )?;

    let mut records = vec![];
    let mut torn = 0;
    for (slot, bytes) in buf.chunks(config.block_size).enumerate() {
        let location = Location { extent, slot: slot as u32 };
        match record::decode(bytes) {
            Slot::Valid(record)
                if record.kind != RecordKind::Index && record.lsn > after_lsn =>
            {
                log::trace!(
                    "replaying {:?} of block {} lsn {} at {}",
                    record.kind,
                    record.block_id,
                    record.lsn,
                    location
                );
                records.push(Replayed {
                    lsn: record.lsn,
                    location,
                    block_id: record.block_id,
                    kind: record.kind,
                });
            }
            Slot::Valid(_) | Slot::Unwritten => {}
            Slot::Corrupt => {
                log::warn!("skipping torn or corrupt slot at {}", location);
                torn += 1;
            }
        }
    }

    Ok((records, torn))
}
