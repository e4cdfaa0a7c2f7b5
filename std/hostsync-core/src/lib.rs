//!
//! hostsync-core - Host Bridge Types
//!
//! This crate provides the types every hostsync container shares with the
//! managed runtime it is embedded in:
//!
//! - `Handle` for references to host-owned values (never freed by us)
//! - `HostError` for exceptions raised by host callbacks
//! - `Tracer`, `Trace` and `GcGate` for the host's tracing garbage collector
//! - `ExecutionLock` and `Unlocked` for releasing the global execution lock
//!   around blocking waits
//! - `HostCallback` and the `HOSTSYNC_*` status codes for the C boundary
//! - `SyncConfig` and `SyncError`
//!
//! Containers built on these types never need external locking, and none of
//! them ever dereferences a handle.
//!

pub mod callback;
pub mod config;
pub mod error;
pub mod exec_lock;
pub mod gc_gate;
pub mod handle;
pub mod trace;

pub use callback::*;
pub use config::{SyncConfig, install as install_config, global as global_config};
pub use error::*;
pub use exec_lock::*;
pub use gc_gate::*;
pub use handle::*;
pub use trace::*;

/// A container that can be handed to several execution contexts at once.
///
/// Every container exposed over the C boundary must be `Send + Sync` and
/// must report its handles to the collector. The bound is checked once, when
/// the container is boxed for the host, never on individual operations.
pub trait Shareable: Trace + Send + Sync {}

/// Box a fully constructed container for the host.
///
/// The returned pointer is released with [`free_shared`].
pub fn into_shared<T: Shareable>(container: T) -> *mut T {
    Box::into_raw(Box::new(container))
}

/// Drop a container previously returned by [`into_shared`].
///
/// # Safety
///
/// `ptr` must be null or come from `into_shared::<T>` and not have been freed.
pub unsafe fn free_shared<T: Shareable>(ptr: *mut T) {
    if !ptr.is_null() {
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Report a shared container's handles to the host's mark hook.
///
/// # Safety
///
/// `ptr` must be null or point to a live container from `into_shared`.
pub unsafe fn mark_shared<T: Shareable>(ptr: *const T, mark: MarkFn) {
    if let Some(container) = unsafe { ptr.as_ref() } {
        container.trace(&mut MarkFnTracer::new(mark));
    }
}
