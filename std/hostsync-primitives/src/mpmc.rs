//!
//! MPMC Queue
//!
//! Bounded multi-producer multi-consumer ring after Dmitry Vyukov's design.
//! Each cell carries a sequence number that tells a producer or consumer
//! whether the cell is ready for it:
//!
//! - `sequence == pos`: free, a producer at `pos` may claim it
//! - `sequence == pos + 1`: full, a consumer at `pos` may claim it
//!
//! Claiming is a CAS on `enqueue_pos` / `dequeue_pos`; the value is written
//! or read afterwards and published by storing the next sequence. Between
//! the CAS and that store the cell is in flight, so every push and pop runs
//! inside the `GcGate` as a mutator and the trace runs as the collector.
//!
//! A single cell cannot tell "full at `pos`" from "free for `pos + 1`", so
//! the ring always has at least two cells. The queue's own capacity is
//! enforced by `writable`: a push takes a permit before claiming a cell and
//! a pop gives it back once the cell is free again.
//!
//! Blocking `push` waits on `writable`; blocking `pop` retries the lock-free
//! dequeue and sleeps on `readable` in between. Both wait with the execution
//! lock released.
//!

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use hostsync_core::{
    ExecutionLock, GcGate, HOSTSYNC_NONE, HOSTSYNC_OK, HOSTSYNC_UNINITIALIZED, Handle,
    HostLockHooks, MarkFn, Shareable, SyncError, Trace, Tracer, Unlocked, free_shared,
    into_shared, lock_from_hooks, mark_shared, write_handle,
};

use crate::semaphore::Semaphore;

struct Cell {
    sequence: AtomicUsize,
    value: UnsafeCell<Handle>,
}

pub struct MpmcQueue {
    buffer: Box<[Cell]>,
    capacity: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    readable: Semaphore,
    writable: Semaphore,
    gate: GcGate,
}

// SAFETY: a cell's value is only touched by the thread that won the CAS for
// its position, or by the collector while the gate excludes every mutator.
unsafe impl Sync for MpmcQueue {}

impl MpmcQueue {
    pub fn new(capacity: usize) -> Result<Self, SyncError> {
        if capacity == 0 {
            return Err(SyncError::InvalidCapacity {
                capacity,
                reason: "queue must hold at least one item",
            });
        }
        let buffer = (0..capacity.max(2))
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(Handle::default()),
            })
            .collect();
        tracing::debug!(capacity, "created mpmc queue");
        Ok(Self {
            buffer,
            capacity,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            readable: Semaphore::new(0, capacity),
            writable: Semaphore::new(capacity, capacity),
            gate: GcGate::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items enqueued and not yet dequeued. Exact only when no push or pop
    /// is in flight.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::SeqCst);
        let head = self.dequeue_pos.load(Ordering::SeqCst);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, pos: usize) -> &Cell {
        &self.buffer[pos % self.buffer.len()]
    }

    fn enqueue(&self, value: Handle) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = loop {
            let cell = self.cell(pos);
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => break cell,
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        };
        // SAFETY: the CAS made this thread the only writer of the cell.
        unsafe { *cell.value.get() = value };
        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
        true
    }

    fn dequeue(&self) -> Option<Handle> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = loop {
            let cell = self.cell(pos);
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => break cell,
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        };
        // SAFETY: the CAS made this thread the only reader of the cell.
        let value = unsafe { *cell.value.get() };
        cell.sequence.store(pos.wrapping_add(self.buffer.len()), Ordering::Release);
        Some(value)
    }

    /// Append `value` unless the queue is full. A pop that has claimed the
    /// oldest cell but not yet freed it still counts as occupying it.
    pub fn try_push(&self, value: Handle) -> bool {
        if !self.writable.try_acquire() {
            return false;
        }
        let pushed = self.gate.acquire_as_mutator(|| self.enqueue(value));
        if pushed {
            self.readable.release();
        } else {
            self.writable.release();
        }
        pushed
    }

    pub fn try_pop(&self) -> Option<Handle> {
        let value = self.gate.acquire_as_mutator(|| self.dequeue());
        if value.is_some() {
            self.writable.release();
        }
        value
    }

    /// Append `value`, waiting for space with the execution lock released.
    pub fn push<L: ExecutionLock + ?Sized>(&self, lock: &L, value: Handle) {
        if self.try_push(value) {
            return;
        }
        {
            let _unlocked = Unlocked::new(lock);
            tracing::trace!("mpmc queue full, waiting");
            self.writable.acquire();
        }
        // The permit guarantees room; a cell can only lag behind while a
        // concurrent pop finishes freeing it.
        while !self.gate.acquire_as_mutator(|| self.enqueue(value)) {
            std::thread::yield_now();
        }
        self.readable.release();
    }

    /// Remove the oldest item, waiting for one with the execution lock
    /// released.
    pub fn pop<L: ExecutionLock + ?Sized>(&self, lock: &L) -> Handle {
        if let Some(value) = self.try_pop() {
            return value;
        }
        let _unlocked = Unlocked::new(lock);
        loop {
            tracing::trace!("mpmc queue empty, waiting");
            self.readable.acquire();
            if let Some(value) = self.try_pop() {
                return value;
            }
        }
    }

    /// Run `f` while no push or pop is in flight.
    pub fn acquire_as_gc<T>(&self, f: impl FnOnce() -> T) -> T {
        self.gate.acquire_as_gc(f)
    }
}

impl Trace for MpmcQueue {
    fn trace(&self, tracer: &mut dyn Tracer) {
        self.gate.acquire_as_gc(|| {
            let tail = self.enqueue_pos.load(Ordering::SeqCst);
            let mut pos = self.dequeue_pos.load(Ordering::SeqCst);
            while pos != tail {
                // SAFETY: the gate is held exclusively, so every cell between
                // the positions is fully written and nobody is touching it.
                tracer.mark(unsafe { *self.cell(pos).value.get() });
                pos = pos.wrapping_add(1);
            }
        })
    }
}

impl Shareable for MpmcQueue {}

impl fmt::Debug for MpmcQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

/// Returns null when `capacity` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn hostsync_mpmc_new(capacity: usize) -> *mut MpmcQueue {
    match MpmcQueue::new(capacity) {
        Ok(queue) => into_shared(queue),
        Err(e) => {
            tracing::error!(error = %e, "hostsync_mpmc_new rejected its arguments");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_free(queue: *mut MpmcQueue) {
    unsafe { free_shared(queue) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_mark(queue: *const MpmcQueue, mark: MarkFn) {
    unsafe { mark_shared(queue, mark) }
}

/// `HOSTSYNC_NONE` means the queue was full.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_try_push(queue: *const MpmcQueue, value: u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    if queue.try_push(Handle::from_raw(value)) { HOSTSYNC_OK } else { HOSTSYNC_NONE }
}

/// The oldest item, or `fallback` when the queue is empty.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_try_pop(queue: *const MpmcQueue, fallback: u64) -> u64 {
    match unsafe { queue.as_ref() } {
        Some(queue) => queue.try_pop().map_or(fallback, Handle::to_raw),
        None => fallback,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_push(queue: *const MpmcQueue, hooks: *const HostLockHooks, value: u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    queue.push(unsafe { lock_from_hooks(hooks) }, Handle::from_raw(value));
    HOSTSYNC_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_pop(queue: *const MpmcQueue, hooks: *const HostLockHooks, out_value: *mut u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    let value = queue.pop(unsafe { lock_from_hooks(hooks) });
    unsafe { write_handle(out_value, value) };
    HOSTSYNC_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_mpmc_len(queue: *const MpmcQueue) -> usize {
    match unsafe { queue.as_ref() } {
        Some(queue) => queue.len(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostsync_core::{NoLock, collect_marked};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn h(raw: u64) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn test_fifo() {
        let queue = MpmcQueue::new(4).unwrap();
        for i in 1..=3 {
            assert!(queue.try_push(h(i)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(h(1)));
        assert_eq!(queue.try_pop(), Some(h(2)));
        assert_eq!(queue.try_pop(), Some(h(3)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_bound_with_odd_capacity() {
        let queue = MpmcQueue::new(3).unwrap();
        for round in 0..5u64 {
            for i in 0..3 {
                assert!(queue.try_push(h(round * 10 + i)));
            }
            assert!(!queue.try_push(h(99)));

            assert_eq!(queue.try_pop(), Some(h(round * 10)));
            assert!(queue.try_push(h(round * 10 + 3)));
            for i in 1..=3 {
                assert_eq!(queue.try_pop(), Some(h(round * 10 + i)));
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_capacity_one() {
        let queue = MpmcQueue::new(1).unwrap();
        assert!(queue.try_push(h(1)));
        assert!(!queue.try_push(h(2)));
        assert_eq!(queue.try_pop(), Some(h(1)));
        assert!(queue.try_push(h(2)));
        assert_eq!(queue.try_pop(), Some(h(2)));
    }

    #[test]
    fn test_capacity_one_trace_and_len() {
        let queue = MpmcQueue::new(1).unwrap();
        assert_eq!(queue.capacity(), 1);
        for round in 0..4u64 {
            assert!(queue.try_push(h(round)));
            assert!(!queue.try_push(h(100 + round)));
            assert_eq!(queue.len(), 1);
            assert_eq!(collect_marked(&queue), vec![h(round)]);
            assert_eq!(queue.try_pop(), Some(h(round)));
            assert_eq!(queue.try_pop(), None);
        }
    }

    #[test]
    fn test_capacity_one_blocking() {
        let queue = Arc::new(MpmcQueue::new(1).unwrap());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || (0..500).map(|_| queue.pop(&NoLock).to_raw()).collect::<Vec<_>>())
        };

        for i in 0..500 {
            queue.push(&NoLock, h(i));
            assert!(queue.len() <= 1);
        }

        assert_eq!(consumer.join().unwrap(), (0..500).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(MpmcQueue::new(0), Err(SyncError::InvalidCapacity { capacity: 0, .. })));
        assert!(hostsync_mpmc_new(0).is_null());
    }

    #[test]
    fn test_blocking_round_trip() {
        let queue = Arc::new(MpmcQueue::new(2).unwrap());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || (0..1000).map(|_| queue.pop(&NoLock).to_raw()).collect::<Vec<_>>())
        };

        for i in 0..1000 {
            queue.push(&NoLock, h(i));
        }

        assert_eq!(consumer.join().unwrap(), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let queue = Arc::new(MpmcQueue::new(8).unwrap());
        let producers = 4u64;
        let per_producer = 2500u64;
        let consumers = 4u64;
        let per_consumer = producers * per_producer / consumers;

        let consumer_handles: Vec<_> = (0..consumers).map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || (0..per_consumer).map(|_| queue.pop(&NoLock).to_raw()).collect::<Vec<_>>())
        }).collect();

        let producer_handles: Vec<_> = (0..producers).map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..per_producer {
                    queue.push(&NoLock, h(p * per_producer + i));
                }
            })
        }).collect();

        for handle in producer_handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        for handle in consumer_handles {
            let popped = handle.join().unwrap();
            // A consumer sees each producer's items in push order.
            for p in 0..producers {
                let mine: Vec<_> = popped.iter().filter(|v| **v / per_producer == p).collect();
                assert!(mine.windows(2).all(|w| w[0] < w[1]));
            }
            seen.extend(popped);
        }
        assert_eq!(seen.len() as u64, producers * per_producer);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_trace_after_wraparound() {
        let queue = MpmcQueue::new(4).unwrap();
        for i in 0..7 {
            queue.try_push(h(i));
            if i % 2 == 0 {
                queue.try_pop();
            }
        }
        assert_eq!(collect_marked(&queue), vec![h(4), h(5), h(6)]);
    }

    #[test]
    fn test_acquire_as_gc_runs_exclusively() {
        let queue = MpmcQueue::new(2).unwrap();
        queue.try_push(h(1));
        let len = queue.acquire_as_gc(|| queue.len());
        assert_eq!(len, 1);
    }

    #[test]
    fn test_mpmc_ffi() {
        let queue = hostsync_mpmc_new(2);
        let mut out = 0u64;
        unsafe {
            assert_eq!(hostsync_mpmc_try_pop(queue, 99), 99);
            assert_eq!(hostsync_mpmc_try_push(queue, 5), HOSTSYNC_OK);
            assert_eq!(hostsync_mpmc_push(queue, std::ptr::null(), 6), HOSTSYNC_OK);
            assert_eq!(hostsync_mpmc_try_push(queue, 7), HOSTSYNC_NONE);
            assert_eq!(hostsync_mpmc_len(queue), 2);
            assert_eq!(hostsync_mpmc_pop(queue, std::ptr::null(), &mut out), HOSTSYNC_OK);
            assert_eq!(out, 5);
            assert_eq!(hostsync_mpmc_try_pop(queue, 0), 6);
            hostsync_mpmc_free(queue);

            let null = std::ptr::null::<MpmcQueue>();
            assert_eq!(hostsync_mpmc_try_push(null, 1), HOSTSYNC_UNINITIALIZED);
            assert_eq!(hostsync_mpmc_try_pop(null, 42), 42);
            assert_eq!(hostsync_mpmc_len(null), 0);
        }
    }
}
