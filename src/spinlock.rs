use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use crate::backoff::Backoff;

/// Short-hold mutual exclusion for in-memory index structures where
/// contention is expected to be brief. Not reentrant: locking twice
/// from the same thread deadlocks.
pub struct Spinlock<T> {
    lock: AtomicBool,
    inner: UnsafeCell<T>,
}

#[allow(unsafe_code)]
unsafe impl<T: Send> Send for Spinlock<T> {}

#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for Spinlock<T> {}

/// Exclusive access to the contents of a [`Spinlock`], released on drop.
pub struct SpinlockGuard<'a, T> {
    mu: &'a Spinlock<T>,
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(self.mu.lock.swap(false, Release));
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        #[allow(unsafe_code)]
        unsafe {
            &*self.mu.inner.get()
        }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        #[allow(unsafe_code)]
        unsafe {
            &mut *self.mu.inner.get()
        }
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Spinlock<T> {
        Spinlock::new(T::default())
    }
}

impl<T> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.lock.load(Relaxed))
            .finish()
    }
}

impl<T> Spinlock<T> {
    /// Creates a new unlocked `Spinlock`.
    pub const fn new(inner: T) -> Spinlock<T> {
        Spinlock { lock: AtomicBool::new(false), inner: UnsafeCell::new(inner) }
    }

    /// Attempts to take the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.lock.compare_exchange(false, true, Acquire, Relaxed).is_ok() {
            Some(SpinlockGuard { mu: self })
        } else {
            None
        }
    }

    /// Spins until the lock is taken.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.lock.load(Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Consumes the lock, returning its contents.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
