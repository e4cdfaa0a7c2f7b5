///
/// Fixed-Size Object Pool
///
/// Hands out at most `max_size` host objects, created lazily by a factory.
/// Each slot moves through
///
/// ```text
/// Empty -> Creating -> Leased -> Idle -> Leased -> ...
///              |
///              +-> Empty   (factory failed)
/// ```
///
/// `checkout` prefers an idle item, then reserves an empty slot and calls
/// the factory with the pool lock dropped (the caller's execution lock stays
/// held, since the factory is host code). Only when every slot is leased or
/// being created does it wait, with the execution lock released, until an
/// item is checked in or the timeout elapses.
///
/// Wakeups are best-effort: a checkin wakes one waiter, but a thread that
/// arrives later may take the item first. A woken waiter that loses the race
/// goes back to waiting for the rest of its timeout.
///

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hostsync_core::{
    ExecutionLock, HOSTSYNC_MISUSE, HOSTSYNC_NONE, HOSTSYNC_OK, HOSTSYNC_UNINITIALIZED, Handle,
    HostCallback, HostError, HostLockHooks, MarkFn, Shareable, SyncError, Trace, Tracer, Unlocked,
    free_shared, global_config, into_shared, lock_from_hooks, mark_shared, write_host_error,
};

/// Creates the pooled objects.
pub trait ItemFactory: Send + Sync {
    fn create(&self) -> Result<Handle, HostError>;
}

impl<F> ItemFactory for F
where
    F: Fn() -> Result<Handle, HostError> + Send + Sync,
{
    fn create(&self) -> Result<Handle, HostError> {
        self()
    }
}

/// Factory supplied over the C boundary, called as `factory(ctx, 0, 0, out)`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct HostFactory(pub HostCallback);

impl ItemFactory for HostFactory {
    fn create(&self) -> Result<Handle, HostError> {
        self.0.call0()
    }
}

/// A checked-out item: the slot to check back in and the object itself.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledItem {
    pub index: usize,
    pub handle: Handle,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Creating,
    Idle(Handle),
    Leased(Handle),
}

struct PoolState {
    slots: Vec<Slot>,
    idle: VecDeque<usize>,
    empty: Vec<usize>,
}

enum Acquired {
    Idle(PooledItem),
    Reserved(usize),
    Exhausted,
}

impl PoolState {
    fn acquire(&mut self) -> Acquired {
        while let Some(index) = self.idle.pop_front() {
            if let Slot::Idle(handle) = self.slots[index] {
                self.slots[index] = Slot::Leased(handle);
                return Acquired::Idle(PooledItem { index, handle });
            }
        }
        if let Some(index) = self.empty.pop() {
            self.slots[index] = Slot::Creating;
            return Acquired::Reserved(index);
        }
        Acquired::Exhausted
    }
}

pub struct FixedSizeObjectPool<F: ItemFactory> {
    state: Mutex<PoolState>,
    available: Condvar,
    timeout: Duration,
    factory: F,
}

/// A reserved slot waiting for the factory. Dropped without `commit` (the
/// factory failed or panicked), it returns the slot to `Empty`.
struct Reservation<'a, F: ItemFactory> {
    pool: &'a FixedSizeObjectPool<F>,
    index: usize,
    committed: bool,
}

impl<F: ItemFactory> Reservation<'_, F> {
    fn commit(mut self, handle: Handle) -> PooledItem {
        self.committed = true;
        self.pool.state.lock().slots[self.index] = Slot::Leased(handle);
        PooledItem { index: self.index, handle }
    }
}

impl<F: ItemFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        {
            let mut state = self.pool.state.lock();
            state.slots[self.index] = Slot::Empty;
            state.empty.push(self.index);
        }
        self.pool.available.notify_one();
    }
}

impl<F: ItemFactory> FixedSizeObjectPool<F> {
    pub fn new(max_size: usize, timeout: Duration, factory: F) -> Result<Self, SyncError> {
        if max_size == 0 {
            return Err(SyncError::InvalidCapacity {
                capacity: max_size,
                reason: "pool must hold at least one item",
            });
        }
        tracing::debug!(max_size, timeout_ms = timeout.as_millis() as u64, "created object pool");
        Ok(Self {
            state: Mutex::new(PoolState {
                slots: vec![Slot::Empty; max_size],
                idle: VecDeque::with_capacity(max_size),
                // Popped from the back, so slot 0 is filled first.
                empty: (0..max_size).rev().collect(),
            }),
            available: Condvar::new(),
            timeout,
            factory,
        })
    }

    /// Pool with the configured default timeout.
    pub fn with_default_timeout(max_size: usize, factory: F) -> Result<Self, SyncError> {
        Self::new(max_size, global_config().pool_timeout(), factory)
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Items created so far (idle or leased).
    pub fn created(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Idle(_) | Slot::Leased(_)))
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Lease an item, waiting up to the pool timeout. `Ok(None)` means the
    /// timeout elapsed with every item still leased.
    pub fn checkout<L: ExecutionLock + ?Sized>(&self, lock: &L) -> Result<Option<PooledItem>, SyncError> {
        let mut state = self.state.lock();
        let first = state.acquire();
        let acquired = match first {
            Acquired::Exhausted => {
                let deadline = Instant::now() + self.timeout;
                let unlocked = Unlocked::new(lock);
                let acquired = loop {
                    tracing::trace!("waiting for a pooled item");
                    let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
                    match state.acquire() {
                        Acquired::Exhausted if !timed_out => continue,
                        other => break other,
                    }
                };
                drop(state);
                drop(unlocked);
                acquired
            }
            other => {
                drop(state);
                other
            }
        };

        match acquired {
            Acquired::Idle(item) => Ok(Some(item)),
            Acquired::Reserved(index) => self.create(index).map(Some),
            Acquired::Exhausted => {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "pool checkout timed out");
                Ok(None)
            }
        }
    }

    fn create(&self, index: usize) -> Result<PooledItem, SyncError> {
        let reservation = Reservation { pool: self, index, committed: false };
        let handle = self.factory.create()?;
        tracing::debug!(index, "created pooled item");
        Ok(reservation.commit(handle))
    }

    /// Return a leased slot. Checking in a slot that is not leased leaves the
    /// pool untouched and reports the misuse.
    pub fn checkin(&self, index: usize) -> Result<(), SyncError> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let size = state.slots.len();
            let Some(slot) = state.slots.get_mut(index) else {
                tracing::error!(index, size, "checkin of a slot outside the pool");
                return Err(SyncError::IndexOutOfRange { index, size });
            };
            let Slot::Leased(handle) = *slot else {
                tracing::error!(index, "checkin of a slot that is not checked out");
                return Err(SyncError::NotCheckedOut { index });
            };
            *slot = Slot::Idle(handle);
            state.idle.push_back(index);
        }
        self.available.notify_one();
        Ok(())
    }

    /// `checkout` wrapped in a guard that checks the item back in on drop.
    pub fn lease<L: ExecutionLock + ?Sized>(&self, lock: &L) -> Result<Option<Lease<'_, F>>, SyncError> {
        Ok(self.checkout(lock)?.map(|item| Lease { pool: self, item }))
    }

    /// Run `f` with a leased item. Running out of time is an error here.
    pub fn with<L, T>(&self, lock: &L, f: impl FnOnce(Handle) -> T) -> Result<T, SyncError>
    where
        L: ExecutionLock + ?Sized,
    {
        match self.lease(lock)? {
            Some(lease) => Ok(f(lease.handle())),
            None => Err(SyncError::Timeout { timeout_ms: self.timeout.as_millis() as u64 }),
        }
    }
}

impl<F: ItemFactory> Trace for FixedSizeObjectPool<F> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        let state = self.state.lock();
        for slot in &state.slots {
            if let Slot::Idle(handle) | Slot::Leased(handle) = slot {
                tracer.mark(*handle);
            }
        }
    }
}

impl<F: ItemFactory> Shareable for FixedSizeObjectPool<F> {}

impl<F: ItemFactory> fmt::Debug for FixedSizeObjectPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FixedSizeObjectPool")
            .field("max_size", &state.slots.len())
            .field("idle", &state.idle.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A leased item, checked back in when dropped.
pub struct Lease<'a, F: ItemFactory> {
    pool: &'a FixedSizeObjectPool<F>,
    item: PooledItem,
}

impl<F: ItemFactory> Lease<'_, F> {
    pub fn handle(&self) -> Handle {
        self.item.handle
    }

    pub fn index(&self) -> usize {
        self.item.index
    }
}

impl<F: ItemFactory> Drop for Lease<'_, F> {
    fn drop(&mut self) {
        // A lease owns its slot, so this only fails if someone checked the
        // index in by hand, which `checkin` has already logged.
        let _ = self.pool.checkin(self.item.index);
    }
}

pub type HostPool = FixedSizeObjectPool<HostFactory>;

/// Create a pool. A negative `timeout_ms` uses the configured default.
/// Returns null when `max_size` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn hostsync_pool_new(max_size: usize, timeout_ms: i64, factory: HostCallback) -> *mut HostPool {
    let timeout = match u64::try_from(timeout_ms) {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => global_config().pool_timeout(),
    };
    match FixedSizeObjectPool::new(max_size, timeout, HostFactory(factory)) {
        Ok(pool) => into_shared(pool),
        Err(e) => {
            tracing::error!(error = %e, "hostsync_pool_new rejected its arguments");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_pool_free(pool: *mut HostPool) {
    unsafe { free_shared(pool) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_pool_mark(pool: *const HostPool, mark: MarkFn) {
    unsafe { mark_shared(pool, mark) }
}

/// `HOSTSYNC_NONE` means the timeout elapsed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_pool_checkout(
    pool: *const HostPool,
    hooks: *const HostLockHooks,
    out_item: *mut PooledItem,
    out_error: *mut u64,
) -> i32 {
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    let lock = unsafe { lock_from_hooks(hooks) };
    match pool.checkout(lock) {
        Ok(Some(item)) => {
            if !out_item.is_null() {
                unsafe { *out_item = item };
            }
            HOSTSYNC_OK
        }
        Ok(None) => HOSTSYNC_NONE,
        Err(SyncError::Host(e)) => unsafe { write_host_error(out_error, &e) },
        Err(_) => HOSTSYNC_MISUSE,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_pool_checkin(pool: *const HostPool, index: usize) -> i32 {
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    match pool.checkin(index) {
        Ok(()) => HOSTSYNC_OK,
        Err(_) => HOSTSYNC_MISUSE,
    }
}
