//! Counting semaphore used by `MpmcQueue`.
//!
//! The queue's `writable` semaphore counts free places exactly, so its
//! releases never run into the limit. `readable` is only a hint
//! that items arrived: a woken consumer retries its lock-free pop and may go
//! back to sleep, and permits saturate at `max_permits` so pushes without a
//! matching blocking pop cannot grow the count without bound.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

pub(crate) struct Semaphore {
    permits: AtomicUsize,
    max_permits: usize,
    waiters: AtomicUsize,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize, max_permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits.min(max_permits)),
            max_permits,
            waiters: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn available_permits(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::SeqCst);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Block until a permit is available and take it.
    pub(crate) fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }

            let mut guard = self.mutex.lock();
            self.waiters.fetch_add(1, Ordering::SeqCst);
            // A release that lands after this load sees `waiters > 0` and
            // notifies under the mutex, which we hold until `wait` parks us.
            if self.permits.load(Ordering::SeqCst) == 0 {
                self.condvar.wait(&mut guard);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn release(&self) {
        let mut current = self.permits.load(Ordering::SeqCst);
        while current < self.max_permits {
            match self.permits.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.mutex.lock();
            self.condvar.notify_one();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available_permits())
            .field("max", &self.max_permits)
            .finish()
    }
}
