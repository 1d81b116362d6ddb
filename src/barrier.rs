use std::sync::Barrier;

/// A counting barrier that synchronizes a fixed number of worker
/// threads at startup and shutdown boundaries.
///
/// # Panics
///
/// Constructing a barrier for zero workers is a programming error
/// and panics immediately.
#[derive(Debug)]
pub struct ThreadBarrier {
    num_workers: usize,
    barrier: Barrier,
}

impl ThreadBarrier {
    /// Creates a barrier that releases its waiters once `num_workers`
    /// threads have called [`ThreadBarrier::wait`].
    pub fn new(num_workers: usize) -> ThreadBarrier {
        assert!(
            num_workers > 0,
            "ThreadBarrier requires at least one worker"
        );
        ThreadBarrier { num_workers, barrier: Barrier::new(num_workers) }
    }

    /// Blocks until all workers have arrived. Exactly one of the
    /// released threads receives `true`.
    pub fn wait(&self) -> bool {
        self.barrier.wait().is_leader()
    }

    /// The number of threads this barrier waits for.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}
