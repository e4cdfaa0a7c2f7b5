//!
//! hostsync-primitives - Concurrency Primitives
//!
//! Containers that a managed host runtime can share between threads and
//! isolated execution contexts.
//!
//! ## Counter
//!
//! - `AtomicCounter` - lock-free `u64` with sequentially consistent
//!   increment, read and write
//!
//! ## Map
//!
//! - `ConcurrentMap` - handle-keyed map sharded over reader-writer locks,
//!   with host-supplied hashing and equality and an atomic
//!   `fetch_and_modify`
//!
//! ## Pool
//!
//! - `FixedSizeObjectPool` - at most N lazily created items; `checkout`
//!   blocks up to a timeout, `checkin` hands the slot back
//!
//! ## Queues
//!
//! - `BoundedQueue` - one mutex, two condition variables
//! - `MpmcQueue` - lock-free sequence-numbered ring with semaphores for the
//!   blocking variants
//!
//! ## Host Cooperation
//!
//! Every container implements `Trace` so the host GC can mark the handles
//! it holds, and every blocking operation takes the host's `ExecutionLock`
//! and releases it only while it actually waits.
//!

pub mod counter;
pub mod map;
pub mod mpmc;
pub mod pool;
pub mod queue;
mod semaphore;

pub use counter::*;
pub use map::*;
pub use mpmc::*;
pub use pool::*;
pub use queue::*;

#[cfg(test)]
pub(crate) fn assert_shareable<T: hostsync_core::Shareable>() {}
