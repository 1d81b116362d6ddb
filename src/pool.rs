//! A fixed set of worker threads, each owning one [`BlockCache`].
//!
//! Block ids are striped over the workers: global id `g` lives in
//! shard `g % n` under the local id `g / n`. Workers never share a
//! cache. Requests reach a worker only as messages on its channel, and
//! every answer comes back through a [`OneShot`].
//!
//! A request whose block is locked or still loading does not hold up
//! its worker. It is parked, and the waker of its [`PendingAcquire`]
//! queues a `Resume` message on the worker's own channel once the
//! block is granted.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::{
    Access, BlockCache, BlockHandle, BlockId, Config, Error, OneShot,
    OneShotFiller, PendingAcquire, Result, ThreadBarrier,
};

enum Request {
    Read { block_id: BlockId, reply: OneShotFiller<Result<Vec<u8>>> },
    Write { block_id: BlockId, data: Vec<u8>, reply: OneShotFiller<Result<()>> },
    Delete { block_id: BlockId, reply: OneShotFiller<Result<()>> },
    Allocate { data: Vec<u8>, reply: OneShotFiller<Result<BlockId>> },
    Lock { block_id: BlockId, reply: OneShotFiller<Result<(u64, Vec<u8>)>> },
    Unlock { lock: u64, data: Option<Vec<u8>> },
    Resume { task: u64 },
    Flush { reply: OneShotFiller<Result<usize>> },
    Shutdown { reply: OneShotFiller<Result<()>> },
}

/// What a parked request does with its block once it is granted.
enum Then {
    Read(OneShotFiller<Result<Vec<u8>>>),
    Write(Vec<u8>, OneShotFiller<Result<()>>),
    Delete(OneShotFiller<Result<()>>),
    Lock(OneShotFiller<Result<(u64, Vec<u8>)>>),
}

/// Shards blocks over `n` worker threads with one cache and one log
/// file each.
///
/// # Examples
///
/// ```
/// use logcache::{Config, WorkerPool};
///
/// let config = Config::new().temporary(true).flush_every_ms(None);
/// let pool = WorkerPool::open(config, 2).unwrap();
///
/// let a = pool.allocate(b"a".to_vec()).unwrap();
/// let b = pool.allocate(b"b".to_vec()).unwrap();
/// assert_ne!(a % 2, b % 2);
///
/// pool.write(a, b"aa".to_vec()).unwrap();
/// assert_eq!(pool.read(a).unwrap(), b"aa");
/// pool.shutdown().unwrap();
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    shards: Vec<Sender<Request>>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    barrier: Arc<ThreadBarrier>,
    next_shard: AtomicUsize,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Read { block_id, .. } => write!(f, "Read({})", block_id),
            Request::Write { block_id, data, .. } => {
                write!(f, "Write({}, {} bytes)", block_id, data.len())
            }
            Request::Delete { block_id, .. } => write!(f, "Delete({})", block_id),
            Request::Allocate { data, .. } => {
                write!(f, "Allocate({} bytes)", data.len())
            }
            Request::Lock { block_id, .. } => write!(f, "Lock({})", block_id),
            Request::Unlock { lock, data } => match data {
                Some(data) => write!(f, "Unlock({}, {} bytes)", lock, data.len()),
                None => write!(f, "Unlock({})", lock),
            },
            Request::Resume { task } => write!(f, "Resume({})", task),
            Request::Flush { .. } => write!(f, "Flush"),
            Request::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl WorkerPool {
    /// Starts `n` workers. Worker `i` keeps its store in the directory
    /// `shard_<i>` below `config.path`, and all of them recover in
    /// parallel before this returns.
    pub fn open(config: Config, n: usize) -> Result<WorkerPool> {
        if n == 0 {
            return Err(Error::Unsupported(
                "a WorkerPool needs at least one worker".into(),
            ));
        }
        config.validate()?;

        // every worker plus the opening thread
        let barrier = Arc::new(ThreadBarrier::new(n + 1));
        let mut shards = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        let mut started = Vec::with_capacity(n);

        for shard in 0..n {
            let (tx, rx) = unbounded();
            let (start_filler, start) = OneShot::pair();
            let shard_config =
                config.clone().path(config.path.join(format!("shard_{}", shard)));
            let barrier = barrier.clone();
            let resume = tx.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("logcache worker {}", shard))
                .spawn(move || {
                    worker(shard, shard_config, &rx, resume, start_filler, &barrier)
                });

            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    // the barrier can no longer be completed, so the
                    // workers spawned so far are never released
                    log::error!("failed to spawn worker {}: {}", shard, e);
                    return Err(e.into());
                }
            };

            shards.push(tx);
            workers.push(handle);
            started.push(start);
        }

        let mut open_error = None;
        for (shard, start) in started.into_iter().enumerate() {
            if let Err(e) = start.wait().unwrap_or(Err(Error::ShutDown)) {
                log::error!("worker {} failed to open its cache: {}", shard, e);
                if open_error.is_none() {
                    open_error = Some(e);
                }
            }
        }
        barrier.wait();

        let pool = WorkerPool {
            shards,
            workers: Mutex::new(Some(workers)),
            barrier,
            next_shard: AtomicUsize::new(0),
        };

        if let Some(e) = open_error {
            let _ = pool.shutdown();
            return Err(e);
        }

        log::debug!("started WorkerPool of {} workers at {:?}", n, config.path);
        Ok(pool)
    }

    /// The number of workers.
    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    fn locate(&self, block_id: BlockId) -> (usize, BlockId) {
        let n = self.shards.len() as u64;
        ((block_id % n) as usize, block_id / n)
    }

    fn call<T>(
        &self,
        shard: usize,
        make: impl FnOnce(OneShotFiller<Result<T>>) -> Request,
    ) -> OneShot<Result<T>> {
        let (reply, answer) = OneShot::pair();
        let request = make(reply);
        log::trace!("sending {:?} to worker {}", request, shard);
        // a failed send drops the reply filler, which resolves the
        // answer to `None`
        let _ = self.shards[shard].send(request);
        answer
    }

    fn wait<T>(answer: OneShot<Result<T>>) -> Result<T> {
        answer.wait().unwrap_or(Err(Error::ShutDown))
    }

    /// Reads the contents of a block.
    pub fn read(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let (shard, local) = self.locate(block_id);
        Self::wait(self.call(shard, |reply| Request::Read { block_id: local, reply }))
    }

    /// Replaces the contents of an existing block.
    pub fn write(&self, block_id: BlockId, data: Vec<u8>) -> Result<()> {
        let (shard, local) = self.locate(block_id);
        Self::wait(self.call(shard, |reply| Request::Write {
            block_id: local,
            data,
            reply,
        }))
    }

    /// Deletes a block.
    pub fn delete(&self, block_id: BlockId) -> Result<()> {
        let (shard, local) = self.locate(block_id);
        Self::wait(self.call(shard, |reply| Request::Delete { block_id: local, reply }))
    }

    /// Holds a block for writing until the returned [`BlockLock`] is
    /// dropped. Other requests for the block wait behind it, while
    /// its worker keeps serving everything else.
    pub fn lock(&self, block_id: BlockId) -> Result<BlockLock> {
        let (shard, local) = self.locate(block_id);
        let (lock, contents) =
            Self::wait(self.call(shard, |reply| Request::Lock { block_id: local, reply }))?;
        Ok(BlockLock {
            block_id,
            lock,
            contents,
            replaced: false,
            worker: self.shards[shard].clone(),
        })
    }

    /// Creates a block holding `data` on the next worker in turn, and
    /// returns its global id.
    pub fn allocate(&self, data: Vec<u8>) -> Result<BlockId> {
        let n = self.shards.len();
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % n;
        let local =
            Self::wait(self.call(shard, |reply| Request::Allocate { data, reply }))?;
        Ok(local * n as u64 + shard as u64)
    }

    /// Flushes every worker's cache. Returns the number of blocks
    /// written.
    pub fn flush(&self) -> Result<usize> {
        let answers: Vec<_> = (0..self.shards.len())
            .map(|shard| self.call(shard, |reply| Request::Flush { reply }))
            .collect();

        let mut flushed = 0;
        for answer in answers {
            flushed += Self::wait(answer)?;
        }
        Ok(flushed)
    }

    /// Flushes and closes every worker's store, and waits for all
    /// workers to exit. Returns the first error any worker hit.
    pub fn shutdown(&self) -> Result<()> {
        let Some(workers) = self.workers.lock().take() else {
            return Ok(());
        };

        let answers: Vec<_> = (0..self.shards.len())
            .map(|shard| self.call(shard, |reply| Request::Shutdown { reply }))
            .collect();

        let mut ret = Ok(());
        for (shard, answer) in answers.into_iter().enumerate() {
            if let Err(e) = Self::wait(answer) {
                log::error!("worker {} failed to shut down cleanly: {}", shard, e);
                if ret.is_ok() {
                    ret = Err(e);
                }
            }
        }

        self.barrier.wait();

        for handle in workers {
            if let Err(e) = handle.join() {
                log::error!("error joining worker thread: {:?}", e);
            }
        }

        log::debug!("WorkerPool shut down");
        ret
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("failed to shut down WorkerPool while dropping it: {}", e);
        }
    }
}

/// Write access to one block of a [`WorkerPool`], obtained from
/// [`WorkerPool::lock`]. New contents set with [`BlockLock::replace`]
/// are stored when the lock is dropped.
#[derive(Debug)]
pub struct BlockLock {
    block_id: BlockId,
    lock: u64,
    contents: Vec<u8>,
    replaced: bool,
    worker: Sender<Request>,
}

impl BlockLock {
    /// The global id of the locked block.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The contents of the block as of locking, or as last replaced.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Sets the contents to store on unlock.
    pub fn replace(&mut self, data: Vec<u8>) {
        self.contents = data;
        self.replaced = true;
    }
}

impl Drop for BlockLock {
    fn drop(&mut self) {
        let data = self.replaced.then(|| std::mem::take(&mut self.contents));
        // a worker that already exited has released the block itself
        let _ = self.worker.send(Request::Unlock { lock: self.lock, data });
    }
}

struct ResumeTask {
    task: u64,
    worker: Sender<Request>,
}

impl Wake for ResumeTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.worker.send(Request::Resume { task: self.task });
    }
}

struct Parked {
    acquire: PendingAcquire,
    then: Then,
}

/// Requests that were not granted immediately, and blocks held on
/// behalf of a [`BlockLock`]. Handles are only ever dropped on the
/// worker's own thread.
struct Tasks {
    resume: Sender<Request>,
    parked: FnvHashMap<u64, Parked>,
    locks: FnvHashMap<u64, BlockHandle>,
    next_id: u64,
}

impl Tasks {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn start(&mut self, acquire: PendingAcquire, then: Then) {
        let task = self.next_id();
        self.poll(task, Parked { acquire, then });
    }

    fn resume(&mut self, task: u64) {
        // wakers may fire more than once
        if let Some(parked) = self.parked.remove(&task) {
            self.poll(task, parked);
        }
    }

    fn poll(&mut self, task: u64, mut parked: Parked) {
        let waker = Waker::from(Arc::new(ResumeTask {
            task,
            worker: self.resume.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        match Pin::new(&mut parked.acquire).poll(&mut cx) {
            Poll::Ready(res) => self.finish(parked.then, res),
            Poll::Pending => {
                log::trace!("parking task {}", task);
                self.parked.insert(task, parked);
            }
        }
    }

    fn finish(&mut self, then: Then, res: Result<BlockHandle>) {
        match then {
            Then::Read(reply) => {
                reply.fill(res.map(|handle| handle.to_vec()));
            }
            Then::Write(data, reply) => {
                reply.fill(res.map(|mut handle| {
                    *handle.data_mut() = data;
                }));
            }
            Then::Delete(reply) => {
                reply.fill(res.map(|mut handle| {
                    handle.mark_deleted();
                }));
            }
            Then::Lock(reply) => match res {
                Ok(handle) => {
                    let lock = self.next_id();
                    let contents = handle.to_vec();
                    self.locks.insert(lock, handle);
                    if reply.try_fill(Ok((lock, contents))).is_err() {
                        // the caller gave up waiting, so nobody will unlock
                        self.locks.remove(&lock);
                    }
                }
                Err(e) => reply.fill(Err(e)),
            },
        }
    }

    fn unlock(&mut self, lock: u64, data: Option<Vec<u8>>) {
        let Some(mut handle) = self.locks.remove(&lock) else {
            log::warn!("unlocking unknown block lock {}", lock);
            return;
        };
        if let Some(data) = data {
            *handle.data_mut() = data;
        }
    }

    /// Gives up on every parked request and releases every lock.
    fn clear(&mut self) {
        if !self.parked.is_empty() || !self.locks.is_empty() {
            log::debug!(
                "dropping {} parked requests and {} block locks",
                self.parked.len(),
                self.locks.len()
            );
        }
        // dropping the replies resolves them to `ShutDown`
        self.parked.clear();
        self.locks.clear();
    }
}

fn worker(
    shard: usize,
    config: Config,
    rx: &Receiver<Request>,
    resume: Sender<Request>,
    started: OneShotFiller<Result<()>>,
    barrier: &ThreadBarrier,
) {
    let cache = BlockCache::open(config);
    started.fill(cache.as_ref().map(|_| ()).map_err(Error::clone));
    barrier.wait();

    let mut cache = cache.ok();
    let mut tasks = Tasks {
        resume,
        parked: FnvHashMap::default(),
        locks: FnvHashMap::default(),
        next_id: 0,
    };
    log::debug!("worker {} serving requests", shard);

    while let Ok(request) = rx.recv() {
        let Some(open) = cache.as_ref() else {
            if let Request::Shutdown { reply } = request {
                reply.fill(Ok(()));
                break;
            }
            // dropping the request resolves its reply to `ShutDown`
            continue;
        };

        match request {
            Request::Read { block_id, reply } => {
                tasks.start(open.acquire(block_id, Access::Read), Then::Read(reply));
            }
            Request::Write { block_id, data, reply } => {
                tasks.start(
                    open.acquire(block_id, Access::Write),
                    Then::Write(data, reply),
                );
            }
            Request::Delete { block_id, reply } => {
                tasks.start(open.acquire(block_id, Access::Write), Then::Delete(reply));
            }
            Request::Lock { block_id, reply } => {
                tasks.start(open.acquire(block_id, Access::Write), Then::Lock(reply));
            }
            Request::Unlock { lock, data } => tasks.unlock(lock, data),
            Request::Resume { task } => tasks.resume(task),
            Request::Allocate { data, reply } => {
                let res = open.allocate().map(|mut handle| {
                    *handle.data_mut() = data;
                    handle.block_id()
                });
                reply.fill(res);
            }
            Request::Flush { reply } => {
                reply.fill(open.flush());
            }
            Request::Shutdown { reply } => {
                tasks.clear();
                let res = open.flush().and_then(|_| open.serializer().shutdown());
                cache = None;
                reply.fill(res);
                break;
            }
        }
    }

    tasks.clear();
    drop(cache);
    log::debug!("worker {} stopping", shard);
    barrier.wait();
}
