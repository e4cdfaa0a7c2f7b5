//!
//! Collector Gate
//!
//! Lock-free containers publish values in several steps (claim a slot,
//! write it, publish its sequence). A trace that ran in the middle of such a
//! step could miss a handle or report a stale one. `GcGate` closes that
//! window: mutators run their short, non-blocking steps inside a shared
//! section, and the collector's trace runs in an exclusive one.
//!
//! Mutators must never wait (on a semaphore, a condvar or the execution
//! lock) while inside the gate.
//!

use parking_lot::RwLock;

pub struct GcGate {
    lock: RwLock<()>,
}

impl GcGate {
    pub fn new() -> Self {
        Self { lock: RwLock::new(()) }
    }

    /// Run a non-blocking mutation step. Many mutators may run at once.
    #[inline]
    pub fn acquire_as_mutator<T>(&self, f: impl FnOnce() -> T) -> T {
        let _section = self.lock.read();
        f()
    }

    /// Run `f` once every in-flight mutation step has finished, keeping new
    /// ones out until it returns.
    pub fn acquire_as_gc<T>(&self, f: impl FnOnce() -> T) -> T {
        let _section = self.lock.write();
        f()
    }
}

impl Default for GcGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GcGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcGate")
            .field("collecting", &self.lock.is_locked_exclusive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mutators_share_the_gate() {
        let gate = GcGate::new();
        let value = gate.acquire_as_mutator(|| gate.lock.is_locked());
        assert!(value);
        assert!(!gate.lock.is_locked());
    }

    #[test]
    fn test_gc_section_excludes_mutators() {
        let gate = GcGate::new();
        let collecting = AtomicBool::new(false);
        let started = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                gate.acquire_as_gc(|| {
                    collecting.store(true, Ordering::SeqCst);
                    started.wait();
                    thread::sleep(Duration::from_millis(50));
                    collecting.store(false, Ordering::SeqCst);
                });
            });
            s.spawn(|| {
                started.wait();
                gate.acquire_as_mutator(|| {
                    assert!(!collecting.load(Ordering::SeqCst));
                });
            });
        });
    }
}
