//! The disk I/O backend.
//!
//! Requests are submitted asynchronously as a tagged [`IoOp`] plus a
//! completion closure. At most `io_depth` requests are outstanding at
//! once; the rest wait in per-account FIFO queues and are pumped to
//! the I/O threads as earlier requests complete. Which account gets
//! the next free submission slot is decided by stride scheduling, so
//! an account with twice the priority gets twice the submissions
//! while both have work queued.
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use fault_injection::{annotate, maybe};
use parking_lot::{Condvar, Mutex};

use crate::{Config, OneShot, backoff::Backoff};

const STRIDE_BASE: u64 = 1 << 20;

/// A handle that biases which queued disk requests are submitted
/// first. Create accounts with [`IoBackend::create_account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    id: usize,
    priority: u32,
}

impl Account {
    /// The account used by user traffic unless another is given.
    pub const DEFAULT: Account = Account { id: 0, priority: 100 };

    /// The account used for background maintenance such as garbage
    /// collection relocations.
    pub const MAINTENANCE: Account = Account { id: 1, priority: 10 };

    /// The relative weight of this account.
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

/// Counters describing the work the backend has performed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    /// Requests handed to the backend.
    pub submitted: u64,
    /// Requests whose completion has run.
    pub completed: u64,
    /// Transient failures that were retried.
    pub retried: u64,
    /// Requests that completed with an error.
    pub failed: u64,
    /// The highest number of requests that were outstanding at once.
    pub max_outstanding: u64,
}

pub(crate) enum IoOp {
    Read { offset: u64, len: usize },
    Write { offset: u64, data: Vec<u8> },
    Sync,
}

impl fmt::Debug for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read { offset, len } => {
                write!(f, "Read {{ offset: {offset}, len: {len} }}")
            }
            IoOp::Write { offset, data } => {
                write!(f, "Write {{ offset: {offset}, len: {} }}", data.len())
            }
            IoOp::Sync => write!(f, "Sync"),
        }
    }
}

pub(crate) enum IoCompletion {
    Read(Vec<u8>),
    Written,
    Synced,
}

type Callback = Box<dyn FnOnce(io::Result<IoCompletion>) + Send + 'static>;

struct Request {
    op: IoOp,
    callback: Callback,
}

enum Job {
    Run(Request),
    Stop,
}

struct AccountQueue {
    priority: u32,
    pass: u64,
    pending: VecDeque<Request>,
}

struct Scheduler {
    accounts: Vec<AccountQueue>,
    outstanding: usize,
    virtual_time: u64,
}

impl Scheduler {
    fn enqueue(&mut self, account: usize, request: Request) {
        let virtual_time = self.virtual_time;
        let queue = &mut self.accounts[account];
        if queue.pending.is_empty() {
            // an idle account does not bank credit while it has
            // nothing queued
            queue.pass = queue.pass.max(virtual_time);
        }
        queue.pending.push_back(request);
    }

    fn pending(&self) -> usize {
        self.accounts.iter().map(|a| a.pending.len()).sum()
    }

    fn next(&mut self) -> Option<Request> {
        let (idx, _) = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.pending.is_empty())
            .min_by_key(|(idx, a)| (a.pass, *idx))?;

        let queue = &mut self.accounts[idx];
        self.virtual_time = queue.pass;
        queue.pass += STRIDE_BASE / u64::from(queue.priority);
        queue.pending.pop_front()
    }
}

struct Shared {
    file: fs::File,
    io_depth: usize,
    io_retries: usize,
    scheduler: Mutex<Scheduler>,
    idle: Condvar,
    jobs: Sender<Job>,
    submitted: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    max_outstanding: AtomicU64,
}

/// Asynchronous positional reads, writes and syncs against one file.
pub struct IoBackend {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for IoBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBackend")
            .field("io_depth", &self.shared.io_depth)
            .field("threads", &self.threads.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl IoBackend {
    /// Starts `config.io_threads` I/O threads operating on `file`.
    pub fn open(file: fs::File, config: &Config) -> io::Result<IoBackend> {
        let (tx, rx) = unbounded();

        let shared = Arc::new(Shared {
            file,
            io_depth: config.io_depth.max(1),
            io_retries: config.io_retries,
            scheduler: Mutex::new(Scheduler {
                accounts: [Account::DEFAULT, Account::MAINTENANCE]
                    .iter()
                    .map(|account| AccountQueue {
                        priority: account.priority,
                        pass: 0,
                        pending: VecDeque::new(),
                    })
                    .collect(),
                outstanding: 0,
                virtual_time: 0,
            }),
            idle: Condvar::new(),
            jobs: tx,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            max_outstanding: AtomicU64::new(0),
        });

        let mut threads = vec![];
        for i in 0..config.io_threads.max(1) {
            let thread_shared = shared.clone();
            let rx: Receiver<Job> = rx.clone();
            let spawn_res = std::thread::Builder::new()
                .name(format!("logcache_io_{i}"))
                .spawn(move || io_thread(&thread_shared, &rx));

            match spawn_res {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    let backend = IoBackend { shared, threads };
                    drop(backend);
                    return Err(annotate!(e));
                }
            }
        }

        Ok(IoBackend { shared, threads })
    }

    /// Registers a new account. Accounts with a higher priority get
    /// proportionally more of the submission slots while competing
    /// with other accounts.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is 0.
    pub fn create_account(&self, priority: u32) -> Account {
        assert!(priority > 0, "accounts must have a non-zero priority");
        let mut scheduler = self.shared.scheduler.lock();
        let id = scheduler.accounts.len();
        let pass = scheduler.virtual_time;
        scheduler.accounts.push(AccountQueue {
            priority,
            pass,
            pending: VecDeque::new(),
        });
        Account { id, priority }
    }

    /// Reads `len` bytes at `offset`. Bytes past the end of the file
    /// read as zeroes.
    pub fn submit_read<F>(&self, account: &Account, offset: u64, len: usize, f: F)
    where
        F: FnOnce(io::Result<Vec<u8>>) + Send + 'static,
    {
        self.submit(
            account,
            IoOp::Read { offset, len },
            Box::new(move |res| {
                f(res.map(|completion| match completion {
                    IoCompletion::Read(data) => data,
                    _ => unreachable!("read completed with a non-read result"),
                }))
            }),
        );
    }

    /// Writes `data` at `offset`. Durability requires a subsequent
    /// sync.
    pub fn submit_write<F>(
        &self,
        account: &Account,
        offset: u64,
        data: Vec<u8>,
        f: F,
    ) where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.submit(
            account,
            IoOp::Write { offset, data },
            Box::new(move |res| f(res.map(|_| ()))),
        );
    }

    /// Makes every completed write durable.
    pub fn submit_sync<F>(&self, account: &Account, f: F)
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.submit(account, IoOp::Sync, Box::new(move |res| f(res.map(|_| ()))));
    }

    /// Blocking version of [`IoBackend::submit_read`].
    pub fn read_at(
        &self,
        account: &Account,
        offset: u64,
        len: usize,
    ) -> io::Result<Vec<u8>> {
        let (filler, future) = OneShot::pair();
        self.submit_read(account, offset, len, move |res| filler.fill(res));
        wait_for_completion(future)
    }

    /// Blocking version of [`IoBackend::submit_write`].
    pub fn write_at(
        &self,
        account: &Account,
        offset: u64,
        data: Vec<u8>,
    ) -> io::Result<()> {
        let (filler, future) = OneShot::pair();
        self.submit_write(account, offset, data, move |res| filler.fill(res));
        wait_for_completion(future)
    }

    /// Submits every write at once and blocks until all of them have
    /// completed. Returns the first error encountered. Durability
    /// requires a subsequent sync.
    pub fn write_many(
        &self,
        account: &Account,
        writes: Vec<(u64, Vec<u8>)>,
    ) -> io::Result<()> {
        let n = writes.len();
        let (tx, rx) = crossbeam_channel::bounded(n);
        for (offset, data) in writes {
            let tx = tx.clone();
            self.submit_write(account, offset, data, move |res| {
                let _ = tx.send(res);
            });
        }
        drop(tx);

        let mut first_error = None;
        for _ in 0..n {
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(io::Error::new(
                        io::ErrorKind::Other,
                        "io request dropped without completing",
                    ));
                    break;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Blocking version of [`IoBackend::submit_sync`].
    pub fn sync(&self, account: &Account) -> io::Result<()> {
        let (filler, future) = OneShot::pair();
        self.submit_sync(account, move |res| filler.fill(res));
        wait_for_completion(future)
    }

    /// The current length of the underlying file.
    pub fn file_len(&self) -> io::Result<u64> {
        Ok(maybe!(self.shared.file.metadata())?.len())
    }

    /// Returns a snapshot of the backend's counters.
    pub fn stats(&self) -> IoStats {
        IoStats {
            submitted: self.shared.submitted.load(Ordering::Acquire),
            completed: self.shared.completed.load(Ordering::Acquire),
            retried: self.shared.retried.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
            max_outstanding: self.shared.max_outstanding.load(Ordering::Acquire),
        }
    }

    fn submit(&self, account: &Account, op: IoOp, callback: Callback) {
        log::trace!("submitting {:?} for account {}", op, account.id);
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        let mut scheduler = self.shared.scheduler.lock();
        assert!(
            account.id < scheduler.accounts.len(),
            "account {:?} does not belong to this backend",
            account
        );
        scheduler.enqueue(account.id, Request { op, callback });
        pump(&self.shared, &mut scheduler);
    }

    /// Blocks until no request is queued or outstanding.
    pub fn quiesce(&self) {
        let mut scheduler = self.shared.scheduler.lock();
        while scheduler.outstanding > 0 || scheduler.pending() > 0 {
            self.shared.idle.wait(&mut scheduler);
        }
    }
}

impl Drop for IoBackend {
    fn drop(&mut self) {
        // submitted requests are never cancelled, so let everything
        // that was handed to us reach the disk first
        self.quiesce();

        for _ in &self.threads {
            let _ = self.shared.jobs.send(Job::Stop);
        }

        for thread in self.threads.drain(..) {
            if let Err(e) = thread.join() {
                log::error!("error joining io thread: {:?}", e);
            }
        }
    }
}

fn wait_for_completion<T>(future: OneShot<io::Result<T>>) -> io::Result<T> {
    match future.wait() {
        Some(res) => res,
        None => Err(io::Error::new(
            io::ErrorKind::Other,
            "io request dropped without completing",
        )),
    }
}

/// Moves queued requests to the io threads until `io_depth` requests
/// are outstanding.
fn pump(shared: &Shared, scheduler: &mut Scheduler) {
    while scheduler.outstanding < shared.io_depth {
        let Some(request) = scheduler.next() else {
            break;
        };

        scheduler.outstanding += 1;
        shared
            .max_outstanding
            .fetch_max(scheduler.outstanding as u64, Ordering::Relaxed);

        if shared.jobs.send(Job::Run(request)).is_err() {
            unreachable!("io threads exited while the backend is alive");
        }
    }
}

fn io_thread(shared: &Shared, rx: &Receiver<Job>) {
    while let Ok(Job::Run(Request { op, callback })) = rx.recv() {
        let res = perform_with_retries(shared, &op);

        if res.is_err() {
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }

        callback(res);

        shared.completed.fetch_add(1, Ordering::Release);

        let mut scheduler = shared.scheduler.lock();
        scheduler.outstanding -= 1;
        pump(shared, &mut scheduler);
        if scheduler.outstanding == 0 && scheduler.pending() == 0 {
            shared.idle.notify_all();
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

fn perform_with_retries(shared: &Shared, op: &IoOp) -> io::Result<IoCompletion> {
    let backoff = Backoff::new();
    let mut attempt = 0;
    loop {
        match perform(&shared.file, op) {
            Err(e) if is_transient(&e) && attempt < shared.io_retries => {
                attempt += 1;
                shared.retried.fetch_add(1, Ordering::Relaxed);
                log::debug!("retrying {:?} after transient error {:?}", op, e);
                backoff.sleep();
            }
            Err(e) => {
                log::error!("disk request {:?} failed: {:?}", op, e);
                return Err(e);
            }
            ok => return ok,
        }
    }
}

fn perform(file: &fs::File, op: &IoOp) -> io::Result<IoCompletion> {
    match op {
        IoOp::Read { offset, len } => {
            let mut data = vec![0; *len];
            sys_io::read_up_to_at(file, &mut data, *offset)?;
            Ok(IoCompletion::Read(data))
        }
        IoOp::Write { offset, data } => {
            sys_io::write_all_at(file, data, *offset)?;
            Ok(IoCompletion::Written)
        }
        IoOp::Sync => {
            maybe!(file.sync_all())?;
            Ok(IoCompletion::Synced)
        }
    }
}

#[cfg(unix)]
mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use super::*;

    /// Fills `buf` from `offset`, leaving the part of `buf` that lies
    /// past the end of the file untouched.
    pub(super) fn read_up_to_at<F: FileExt>(
        file: &F,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.read_at(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }

    pub(super) fn write_all_at<F: FileExt>(
        file: &F,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

#[cfg(windows)]
mod sys_io {
    use std::os::windows::fs::FileExt;

    use super::*;

    pub(super) fn read_up_to_at<F: FileExt>(
        file: &F,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_read(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }

    pub(super) fn write_all_at<F: FileExt>(
        file: &F,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_write(buf, offset)) {
                Ok(0) => {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }
}
