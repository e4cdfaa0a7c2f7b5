///
/// Atomic Counter
///
/// A single lock-free `u64`. Every operation uses `SeqCst` so increments
/// from all threads fall into one total order: with M threads each calling
/// `increment` K times, a later `read` sees exactly initial + M * K.
///
/// Usage from a host binding:
/// ```c
/// hostsync_atomic_counter_t *c = hostsync_counter_new(0);
/// hostsync_counter_increment(c);
/// uint64_t n = hostsync_counter_read(c);
/// hostsync_counter_free(c);
/// ```
///

use std::sync::atomic::{AtomicU64, Ordering};

use hostsync_core::{MarkFn, Shareable, Trace, Tracer, free_shared, into_shared, mark_shared};

#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new(value: u64) -> Self {
        Self { value: AtomicU64::new(value) }
    }

    /// Add one, returning the previous value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst)
    }

    pub fn read(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn write(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst)
    }
}

impl Trace for AtomicCounter {
    fn trace(&self, _tracer: &mut dyn Tracer) {}
}

impl Shareable for AtomicCounter {}

#[unsafe(no_mangle)]
pub extern "C" fn hostsync_counter_new(value: u64) -> *mut AtomicCounter {
    into_shared(AtomicCounter::new(value))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_counter_free(counter: *mut AtomicCounter) {
    unsafe { free_shared(counter) }
}

/// Counters hold no handles; present so every container has the same hooks.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_counter_mark(counter: *const AtomicCounter, mark: MarkFn) {
    unsafe { mark_shared(counter, mark) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_counter_increment(counter: *const AtomicCounter) -> u64 {
    if counter.is_null() {
        return 0;
    }
    unsafe { (*counter).increment() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_counter_read(counter: *const AtomicCounter) -> u64 {
    if counter.is_null() {
        return 0;
    }
    unsafe { (*counter).read() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_counter_write(counter: *const AtomicCounter, value: u64) {
    if counter.is_null() {
        return;
    }
    unsafe { (*counter).write(value) }
}
