//!
//! Bounded Queue
//!
//! FIFO of host handles behind one mutex, with `not_empty` and `not_full`
//! condition variables for the blocking operations. The mutex is never held
//! across a host call or a wait, so the collector can always take it to
//! trace.
//!

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

use hostsync_core::{
    ExecutionLock, HOSTSYNC_NONE, HOSTSYNC_OK, HOSTSYNC_UNINITIALIZED, Handle, HostLockHooks,
    MarkFn, Shareable, SyncError, Trace, Tracer, Unlocked, free_shared, into_shared,
    lock_from_hooks, mark_shared, write_handle,
};

pub struct BoundedQueue {
    items: Mutex<VecDeque<Handle>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Result<Self, SyncError> {
        if capacity == 0 {
            return Err(SyncError::InvalidCapacity {
                capacity,
                reason: "queue must hold at least one item",
            });
        }
        tracing::debug!(capacity, "created bounded queue");
        Ok(Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append `value` unless the queue is full.
    pub fn try_push(&self, value: Handle) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return false;
            }
            items.push_back(value);
        }
        self.not_empty.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<Handle> {
        let value = self.items.lock().pop_front()?;
        self.not_full.notify_one();
        Some(value)
    }

    /// Append `value`, waiting for space with the execution lock released.
    pub fn push<L: ExecutionLock + ?Sized>(&self, lock: &L, value: Handle) {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(value);
            drop(items);
            self.not_empty.notify_one();
            return;
        }

        let unlocked = Unlocked::new(lock);
        while items.len() >= self.capacity {
            tracing::trace!("bounded queue full, waiting");
            self.not_full.wait(&mut items);
        }
        items.push_back(value);
        drop(items);
        self.not_empty.notify_one();
        drop(unlocked);
    }

    /// Remove the oldest item, waiting for one with the execution lock
    /// released.
    pub fn pop<L: ExecutionLock + ?Sized>(&self, lock: &L) -> Handle {
        let mut items = self.items.lock();
        if let Some(value) = items.pop_front() {
            drop(items);
            self.not_full.notify_one();
            return value;
        }

        let unlocked = Unlocked::new(lock);
        let value = loop {
            tracing::trace!("bounded queue empty, waiting");
            self.not_empty.wait(&mut items);
            if let Some(value) = items.pop_front() {
                break value;
            }
        };
        drop(items);
        self.not_full.notify_one();
        drop(unlocked);
        value
    }
}

impl Trace for BoundedQueue {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for value in self.items.lock().iter() {
            tracer.mark(*value);
        }
    }
}

impl Shareable for BoundedQueue {}

impl fmt::Debug for BoundedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Returns null when `capacity` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn hostsync_queue_new(capacity: usize) -> *mut BoundedQueue {
    match BoundedQueue::new(capacity) {
        Ok(queue) => into_shared(queue),
        Err(e) => {
            tracing::error!(error = %e, "hostsync_queue_new rejected its arguments");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_free(queue: *mut BoundedQueue) {
    unsafe { free_shared(queue) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_mark(queue: *const BoundedQueue, mark: MarkFn) {
    unsafe { mark_shared(queue, mark) }
}

/// `HOSTSYNC_NONE` means the queue was full.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_try_push(queue: *const BoundedQueue, value: u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    if queue.try_push(Handle::from_raw(value)) { HOSTSYNC_OK } else { HOSTSYNC_NONE }
}

/// The oldest item, or `fallback` when the queue is empty.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_try_pop(queue: *const BoundedQueue, fallback: u64) -> u64 {
    match unsafe { queue.as_ref() } {
        Some(queue) => queue.try_pop().map_or(fallback, Handle::to_raw),
        None => fallback,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_push(queue: *const BoundedQueue, hooks: *const HostLockHooks, value: u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    queue.push(unsafe { lock_from_hooks(hooks) }, Handle::from_raw(value));
    HOSTSYNC_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_pop(queue: *const BoundedQueue, hooks: *const HostLockHooks, out_value: *mut u64) -> i32 {
    let Some(queue) = (unsafe { queue.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    let value = queue.pop(unsafe { lock_from_hooks(hooks) });
    unsafe { write_handle(out_value, value) };
    HOSTSYNC_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_queue_len(queue: *const BoundedQueue) -> usize {
    match unsafe { queue.as_ref() } {
        Some(queue) => queue.len(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostsync_core::{NoLock, collect_marked};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn h(raw: u64) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn test_fifo() {
        let queue = BoundedQueue::new(3).unwrap();
        assert!(queue.try_push(h(1)));
        assert!(queue.try_push(h(2)));
        assert!(queue.try_push(h(3)));

        assert_eq!(queue.try_pop(), Some(h(1)));
        assert_eq!(queue.try_pop(), Some(h(2)));
        assert_eq!(queue.try_pop(), Some(h(3)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_bound() {
        let queue = BoundedQueue::new(2).unwrap();
        assert!(queue.try_push(h(1)));
        assert!(queue.try_push(h(2)));
        assert!(!queue.try_push(h(3)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(h(1)));
        assert!(queue.try_push(h(3)));
        assert_eq!(queue.try_pop(), Some(h(2)));
        assert_eq!(queue.try_pop(), Some(h(3)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(BoundedQueue::new(0), Err(SyncError::InvalidCapacity { capacity: 0, .. })));
        assert!(hostsync_queue_new(0).is_null());
    }

    #[test]
    fn test_blocking_round_trip() {
        let queue = Arc::new(BoundedQueue::new(1).unwrap());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || (0..100).map(|_| queue.pop(&NoLock).to_raw()).collect::<Vec<_>>())
        };

        for i in 0..100 {
            queue.push(&NoLock, h(i));
        }

        assert_eq!(consumer.join().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_waits_for_space() {
        let queue = Arc::new(BoundedQueue::new(1).unwrap());
        queue.push(&NoLock, h(1));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(&NoLock, h(2)))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(&NoLock), h(1));
        producer.join().unwrap();
        assert_eq!(queue.pop(&NoLock), h(2));
    }

    #[test]
    fn test_trace_reports_queued_items() {
        let queue = BoundedQueue::new(4).unwrap();
        queue.try_push(h(30));
        queue.try_push(h(10));
        queue.try_push(h(20));
        queue.try_pop();

        assert_eq!(collect_marked(&queue), vec![h(10), h(20)]);
    }

    #[test]
    fn test_queue_ffi() {
        let queue = hostsync_queue_new(1);
        let mut out = 0u64;
        unsafe {
            assert_eq!(hostsync_queue_try_pop(queue, 99), 99);
            assert_eq!(hostsync_queue_try_push(queue, 5), HOSTSYNC_OK);
            assert_eq!(hostsync_queue_try_push(queue, 6), HOSTSYNC_NONE);
            assert_eq!(hostsync_queue_len(queue), 1);
            assert_eq!(hostsync_queue_pop(queue, std::ptr::null(), &mut out), HOSTSYNC_OK);
            assert_eq!(out, 5);
            assert_eq!(hostsync_queue_push(queue, std::ptr::null(), 7), HOSTSYNC_OK);
            assert_eq!(hostsync_queue_try_pop(queue, 0), 7);
            hostsync_queue_free(queue);

            let null = std::ptr::null::<BoundedQueue>();
            assert_eq!(hostsync_queue_try_push(null, 1), HOSTSYNC_UNINITIALIZED);
            assert_eq!(hostsync_queue_try_pop(null, 42), 42);
            assert_eq!(hostsync_queue_pop(null, std::ptr::null(), &mut out), HOSTSYNC_UNINITIALIZED);
        }
    }
}
