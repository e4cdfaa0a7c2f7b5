//!
//! Global Execution Lock Protocol
//!
//! The host serializes most work behind one process-wide lock. A thread that
//! is about to block inside a container (waiting for a queue slot, a queue
//! item or a pooled object) must give that lock up for the duration of the
//! wait so unrelated host threads keep running, and must hold it again
//! before control returns to host code.
//!
//! `Unlocked` is that capability as a guard: creating it releases the lock,
//! dropping it reacquires it, on every exit path including timeouts, errors
//! and unwinding.
//!
//! Lock ordering: a container never reacquires the execution lock while it
//! holds one of its own internal locks. Internal guards are always dropped
//! before the `Unlocked` guard.
//!

use std::ffi::c_void;

use parking_lot::lock_api::RawMutex as _;

/// The host's global execution lock, as seen from a blocking operation.
///
/// `release` is only called by a thread that currently holds the lock, and
/// is always paired with exactly one later `reacquire` on the same thread.
pub trait ExecutionLock {
    fn release(&self);
    fn reacquire(&self);
}

/// Execution lock released for the guard's lifetime.
#[must_use = "the execution lock is reacquired as soon as this guard is dropped"]
pub struct Unlocked<'a, L: ExecutionLock + ?Sized> {
    lock: &'a L,
}

impl<'a, L: ExecutionLock + ?Sized> Unlocked<'a, L> {
    pub fn new(lock: &'a L) -> Self {
        lock.release();
        Self { lock }
    }
}

impl<L: ExecutionLock + ?Sized> Drop for Unlocked<'_, L> {
    fn drop(&mut self) {
        self.lock.reacquire();
    }
}

/// Run `f` with the execution lock released.
pub fn without_lock<L: ExecutionLock + ?Sized, T>(lock: &L, f: impl FnOnce() -> T) -> T {
    let _unlocked = Unlocked::new(lock);
    f()
}

/// For callers that hold no execution lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl ExecutionLock for NoLock {
    #[inline]
    fn release(&self) {}

    #[inline]
    fn reacquire(&self) {}
}

/// A process-wide execution lock for hosts that do not bring their own.
///
/// Unlike a `Mutex<()>`, the lock is not tied to a guard's lifetime, so a
/// blocking container operation can give it up and take it back while the
/// caller still holds its `ProcessLockGuard`.
pub struct ProcessLock {
    raw: parking_lot::RawMutex,
}

impl ProcessLock {
    pub const fn new() -> Self {
        Self { raw: parking_lot::RawMutex::INIT }
    }

    pub fn acquire(&self) -> ProcessLockGuard<'_> {
        self.raw.lock();
        ProcessLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Default for ProcessLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLock for ProcessLock {
    fn release(&self) {
        debug_assert!(self.raw.is_locked(), "releasing an execution lock that is not held");
        // SAFETY: callers only release the lock they hold on this thread.
        unsafe { self.raw.unlock() }
    }

    fn reacquire(&self) {
        self.raw.lock();
    }
}

pub struct ProcessLockGuard<'a> {
    lock: &'a ProcessLock,
}

impl ProcessLockGuard<'_> {
    /// The lock this guard holds, for passing into blocking operations.
    pub fn lock(&self) -> &ProcessLock {
        self.lock
    }
}

impl Drop for ProcessLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { self.lock.raw.unlock() }
    }
}

/// Execution lock hooks supplied over the C boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostLockHooks {
    pub release: extern "C" fn(*mut c_void),
    pub reacquire: extern "C" fn(*mut c_void),
    pub ctx: *mut c_void,
}

impl ExecutionLock for HostLockHooks {
    fn release(&self) {
        (self.release)(self.ctx);
    }

    fn reacquire(&self) {
        (self.reacquire)(self.ctx);
    }
}

static NO_LOCK: NoLock = NoLock;

/// Resolve a hooks pointer received over the C boundary. Null means the
/// caller holds no execution lock.
///
/// # Safety
///
/// `hooks` must be null or point to a `HostLockHooks` valid for `'a`.
pub unsafe fn lock_from_hooks<'a>(hooks: *const HostLockHooks) -> &'a dyn ExecutionLock {
    match unsafe { hooks.as_ref() } {
        Some(hooks) => hooks,
        None => &NO_LOCK,
    }
}
