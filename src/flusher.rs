use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{FlushPolicy, Result, cache::CacheCore};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ShutdownState {
    Running,
    ShuttingDown,
    ShutDown,
}

impl ShutdownState {
    fn is_running(self) -> bool {
        matches!(self, ShutdownState::Running)
    }

    fn is_shutdown(self) -> bool {
        matches!(self, ShutdownState::ShutDown)
    }
}

/// A background thread that writes dirty blocks back and collects
/// garbage on an interval, until dropped.
#[derive(Debug)]
pub(crate) struct Flusher {
    shutdown: Arc<Mutex<ShutdownState>>,
    sc: Arc<Condvar>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Flusher {
    pub(crate) fn new(
        name: String,
        cache: Arc<CacheCore>,
        flush_every_ms: u64,
    ) -> io::Result<Self> {
        #[allow(clippy::mutex_atomic)] // mutex used in CondVar below
        let shutdown = Arc::new(Mutex::new(ShutdownState::Running));
        let sc = Arc::new(Condvar::new());

        let join_handle = thread::Builder::new().name(name).spawn({
            let shutdown = shutdown.clone();
            let sc = sc.clone();
            move || run(&shutdown, &sc, &cache, flush_every_ms)
        })?;

        Ok(Self { shutdown, sc, join_handle: Mutex::new(Some(join_handle)) })
    }
}

/// Writes back whatever the configured policy asks for on one sweep.
fn sweep(cache: &CacheCore) -> Result<usize> {
    match cache.config.flush_policy {
        FlushPolicy::OldestFirst { max_batch } => cache.flush(Some(max_batch)),
        FlushPolicy::AllAtCheckpoint => {
            let flushed = cache.flush(None)?;
            if flushed > 0 {
                cache.serializer.checkpoint()?;
            }
            Ok(flushed)
        }
    }
}

fn run(
    shutdown: &Arc<Mutex<ShutdownState>>,
    sc: &Arc<Condvar>,
    cache: &Arc<CacheCore>,
    flush_every_ms: u64,
) {
    let flush_every = Duration::from_millis(flush_every_ms);
    let mut shutdown = shutdown.lock();
    while shutdown.is_running() {
        let before = Instant::now();
        match sweep(cache) {
            Ok(0) => {}
            Ok(flushed) => {
                log::trace!("periodic flush wrote {} blocks", flushed);
            }
            Err(e) => {
                log::error!("failed to flush from periodic flush thread: {}", e);

                *shutdown = ShutdownState::ShutDown;

                // having held the mutex makes this linearized
                // with the notify below.
                drop(shutdown);

                let _notified = sc.notify_all();
                return;
            }
        }

        // spend at most half of the interval relocating blocks
        while {
            let made_progress = match cache.serializer.collect_garbage() {
                Err(e) => {
                    log::error!(
                        "failed to collect garbage from periodic flush thread: {}",
                        e
                    );

                    *shutdown = ShutdownState::ShutDown;

                    // having held the mutex makes this linearized
                    // with the notify below.
                    drop(shutdown);

                    let _notified = sc.notify_all();
                    return;
                }
                Ok(relocated) => relocated > 0,
            };
            made_progress
                && shutdown.is_running()
                && before.elapsed() < flush_every / 2
        } {}

        let sleep_duration = flush_every
            .checked_sub(before.elapsed())
            .unwrap_or_else(|| Duration::from_millis(1));

        if shutdown.is_running() {
            sc.wait_for(&mut shutdown, sleep_duration);
        }
    }

    *shutdown = ShutdownState::ShutDown;

    // having held the mutex makes this linearized
    // with the notify below.
    drop(shutdown);

    let _notified = sc.notify_all();
}

impl Drop for Flusher {
    fn drop(&mut self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_running() {
            *shutdown = ShutdownState::ShuttingDown;
            let _notified = self.sc.notify_all();
        }

        while !shutdown.is_shutdown() {
            // a thread that panicked never reports itself shut down
            let finished = self
                .join_handle
                .lock()
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(true);
            if finished {
                break;
            }
            let _ = self.sc.wait_for(&mut shutdown, Duration::from_millis(100));
        }
        drop(shutdown);

        let mut join_handle_opt = self.join_handle.lock();
        if let Some(join_handle) = join_handle_opt.take() {
            if let Err(e) = join_handle.join() {
                log::error!("error joining flusher thread: {:?}", e);
            }
        }
    }
}
