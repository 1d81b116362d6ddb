use std::cell::Cell;
use std::time::Duration;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Performs exponential backoff in spin loops, and bounded
/// exponential sleeps between retries of failed disk requests.
pub(crate) struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Backoff { step: Cell::new(0) }
    }

    /// Backs off in a spin loop, spinning for the first few steps
    /// and yielding the thread to the OS scheduler after that.
    #[inline]
    pub(crate) fn snooze(&self) {
        if self.step.get() <= SPIN_LIMIT {
            for _ in 0..1 << self.step.get() {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }

        if self.step.get() <= YIELD_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Sleeps before retrying a failed operation. Each step sleeps
    /// twice as long as the previous one, starting at 1ms and capped
    /// at 1024ms.
    pub(crate) fn sleep(&self) {
        let step = self.step.get().min(YIELD_LIMIT);
        std::thread::sleep(Duration::from_millis(1 << step));
        self.step.set(step + 1);
    }
}
