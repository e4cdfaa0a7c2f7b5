//!
//! GC Trace Protocol
//!
//! The host collector discovers reachability by asking every live container
//! to report the handles it holds. A container implements `Trace`; the
//! collector supplies a `Tracer` that receives each handle.
//!
//! Contract for `Trace::trace`:
//! - every handle currently held is reported exactly once
//! - handles no longer held (popped, overwritten, cleared) are not reported
//! - no state observable to other threads is changed
//! - the host calls it with its execution lock held
//!

use crate::handle::Handle;

/// Mark hook supplied by the host GC driver.
pub type MarkFn = extern "C" fn(u64);

/// Receiver for the handles reported by a container during a trace.
pub trait Tracer {
    fn mark(&mut self, handle: Handle);
}

/// A container that holds host handles.
pub trait Trace {
    fn trace(&self, tracer: &mut dyn Tracer);
}

/// Forwards every handle to the host's mark hook.
pub struct MarkFnTracer {
    mark: MarkFn,
}

impl MarkFnTracer {
    pub fn new(mark: MarkFn) -> Self {
        Self { mark }
    }
}

impl Tracer for MarkFnTracer {
    #[inline]
    fn mark(&mut self, handle: Handle) {
        (self.mark)(handle.to_raw());
    }
}

/// Adapts a closure into a tracer.
pub struct FnTracer<F: FnMut(Handle)>(pub F);

impl<F: FnMut(Handle)> Tracer for FnTracer<F> {
    #[inline]
    fn mark(&mut self, handle: Handle) {
        (self.0)(handle);
    }
}

/// Counts reported handles.
#[derive(Debug, Default)]
pub struct CountingTracer {
    pub count: usize,
}

impl Tracer for CountingTracer {
    fn mark(&mut self, _handle: Handle) {
        self.count += 1;
    }
}

/// Records every reported handle, in report order.
#[derive(Debug, Default)]
pub struct CollectingTracer {
    pub marked: Vec<Handle>,
}

impl CollectingTracer {
    /// Reported handles, sorted by raw value.
    pub fn sorted(mut self) -> Vec<Handle> {
        self.marked.sort_unstable_by_key(|h| h.to_raw());
        self.marked
    }
}

impl Tracer for CollectingTracer {
    fn mark(&mut self, handle: Handle) {
        self.marked.push(handle);
    }
}

/// Run a trace pass and collect what it reported.
pub fn collect_marked<T: Trace + ?Sized>(container: &T) -> Vec<Handle> {
    let mut tracer = CollectingTracer::default();
    container.trace(&mut tracer);
    tracer.sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Pair(Handle, Handle);

    impl Trace for Pair {
        fn trace(&self, tracer: &mut dyn Tracer) {
            tracer.mark(self.0);
            tracer.mark(self.1);
        }
    }

    static MARKED_SUM: AtomicU64 = AtomicU64::new(0);

    extern "C" fn sum_marks(raw: u64) {
        MARKED_SUM.fetch_add(raw, Ordering::SeqCst);
    }

    #[test]
    fn test_collect_marked_is_sorted() {
        let pair = Pair(Handle::from_raw(9), Handle::from_raw(3));
        assert_eq!(collect_marked(&pair), vec![Handle::from_raw(3), Handle::from_raw(9)]);
    }

    #[test]
    fn test_counting_and_fn_tracers() {
        let pair = Pair(Handle::from_raw(1), Handle::from_raw(2));

        let mut counting = CountingTracer::default();
        pair.trace(&mut counting);
        assert_eq!(counting.count, 2);

        let mut seen = Vec::new();
        pair.trace(&mut FnTracer(|h: Handle| seen.push(h.to_raw())));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_mark_fn_tracer_calls_hook() {
        MARKED_SUM.store(0, Ordering::SeqCst);
        let pair = Pair(Handle::from_raw(40), Handle::from_raw(2));
        pair.trace(&mut MarkFnTracer::new(sum_marks));
        assert_eq!(MARKED_SUM.load(Ordering::SeqCst), 42);
    }
}
