use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct OneShotState<T> {
    filled: bool,
    fused: bool,
    abandoned: bool,
    item: Option<T>,
    waker: Option<Waker>,
}

impl<T> Default for OneShotState<T> {
    fn default() -> OneShotState<T> {
        OneShotState {
            filled: false,
            fused: false,
            abandoned: false,
            item: None,
            waker: None,
        }
    }
}

/// A Future value which may or may not be filled.
///
/// This is the suspension point of the system: anything that has to
/// wait for disk I/O, a block lock, or another worker returns a
/// `OneShot` that is completed from a queued continuation. It can be
/// blocked on with [`OneShot::wait`] or polled as a `Future`.
///
/// Dropping an unfilled `OneShot` abandons it, and the completer
/// gets the value handed back by [`OneShotFiller::try_fill`].
#[derive(Debug)]
pub struct OneShot<T> {
    mu: Arc<Mutex<OneShotState<T>>>,
    cv: Arc<Condvar>,
}

/// The completer side of the Future
#[derive(Debug)]
pub struct OneShotFiller<T> {
    mu: Arc<Mutex<OneShotState<T>>>,
    cv: Arc<Condvar>,
}

impl<T> OneShot<T> {
    /// Create a new `OneShotFiller` and the `OneShot`
    /// that will be filled by its completion.
    pub fn pair() -> (OneShotFiller<T>, Self) {
        let mu = Arc::new(Mutex::new(OneShotState::default()));
        let cv = Arc::new(Condvar::new());
        let future = Self { mu: mu.clone(), cv: cv.clone() };
        let filler = OneShotFiller { mu, cv };

        (filler, future)
    }

    /// Create a `OneShot` that is already complete.
    pub fn ready(item: T) -> Self {
        let (filler, future) = Self::pair();
        filler.fill(item);
        future
    }

    /// Block on the `OneShot`'s completion
    /// or dropping of the `OneShotFiller`
    pub fn wait(self) -> Option<T> {
        let mut inner = self.mu.lock();
        while !inner.filled {
            self.cv.wait(&mut inner);
        }
        inner.item.take()
    }

    /// Returns `true` if the value is available without blocking.
    pub fn is_ready(&self) -> bool {
        self.mu.lock().filled
    }
}

impl<T> Drop for OneShot<T> {
    fn drop(&mut self) {
        let mut state = self.mu.lock();
        state.abandoned = true;
        let item = state.item.take();
        drop(state);

        // the item is dropped here, on the receiving side and outside
        // of the state mutex, never by the completer
        drop(item);
    }
}

impl<T> Future for OneShot<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.mu.lock();
        if state.fused {
            return Poll::Pending;
        }
        if state.filled {
            state.fused = true;
            Poll::Ready(state.item.take())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> OneShotFiller<T> {
    /// Complete the `OneShot`
    pub fn fill(self, inner: T) {
        if let Err(unwanted) = self.try_fill(inner) {
            drop(unwanted);
        }
    }

    /// Complete the `OneShot`, or hand the value back if the
    /// receiving side has already been dropped.
    pub fn try_fill(self, inner: T) -> Result<(), T> {
        let mut state = self.mu.lock();

        if state.abandoned {
            state.filled = true;
            return Err(inner);
        }

        if let Some(waker) = state.waker.take() {
            waker.wake();
        }

        state.filled = true;
        state.item = Some(inner);

        // having held the mutex makes this linearized
        // with the notify below.
        drop(state);

        let _notified = self.cv.notify_all();
        Ok(())
    }

    /// Returns `true` if nobody is waiting for this value anymore.
    pub fn is_abandoned(&self) -> bool {
        self.mu.lock().abandoned
    }
}

impl<T> Drop for OneShotFiller<T> {
    fn drop(&mut self) {
        let mut state = self.mu.lock();

        if state.filled {
            return;
        }

        if let Some(waker) = state.waker.take() {
            waker.wake();
        }

        state.filled = true;

        // having held the mutex makes this linearized
        // with the notify below.
        drop(state);

        let _notified = self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_receives_value_from_another_thread() {
        let (filler, future) = OneShot::pair();
        std::thread::spawn(move || filler.fill(7_u32));
        assert_eq!(future.wait(), Some(7));
    }

    #[test]
    fn dropped_filler_yields_none() {
        let (filler, future) = OneShot::<u32>::pair();
        drop(filler);
        assert_eq!(future.wait(), None);
    }

    #[test]
    fn abandoned_receiver_hands_value_back() {
        let (filler, future) = OneShot::pair();
        drop(future);
        assert!(filler.is_abandoned());
        assert_eq!(filler.try_fill(vec![1_u8]), Err(vec![1_u8]));
    }
}
