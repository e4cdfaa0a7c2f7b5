//!
//! Concurrent Map
//!
//! A handle-to-handle map split into a power-of-two number of shards, each
//! behind its own `parking_lot::RwLock`. Key hashing and equality belong to
//! the host (`KeyOps`); the map only ever sees the 64-bit hash and asks the
//! host to compare keys whose hashes are equal.
//!
//! Inside a shard, entries are grouped by host hash in a `FxHashMap`, with a
//! `SmallVec` bucket so the common no-collision case stays inline.
//!
//! ## Operation Costs
//!
//! - `hash` is called exactly once per keyed operation, before any lock
//! - `eql` is called only against entries with an equal stored hash, while
//!   the shard lock is held
//! - `get`/`lookup` take a read lock, `set`/`fetch_and_modify` a write lock
//!   on one shard, `clear` the write lock of every shard in index order
//!
//! ## Reentrancy
//!
//! Calling back into the same map from inside `eql` or `modify` is a
//! programmer error. Debug builds detect it before the nested call takes a
//! lock and panic; release builds may deadlock.
//!
//! ## Tracing
//!
//! A trace may start while another thread holds a shard lock and is parked
//! inside a host callback, waiting for the collector to finish. Each shard
//! counts the callbacks in progress under a small mutex. When the table lock
//! cannot be taken and that count is non-zero, the trace holds the mutex and
//! reads the table directly. The table only changes once its lock holder has
//! left the callback, and leaving takes the same mutex, so the holder waits
//! for the trace before it can touch the table again.
//!

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::fmt;
use std::hash::BuildHasher;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxBuildHasher, FxHashMap};
use smallvec::SmallVec;

use hostsync_core::{
    HOSTSYNC_OK, HOSTSYNC_UNINITIALIZED, Handle, HostCallback, HostError,
    MarkFn, Shareable, SyncError, Trace, Tracer, free_shared, global_config, into_shared,
    mark_shared, write_handle, write_host_error,
};

const TRACE_POLL: Duration = Duration::from_millis(1);

/// Host-defined key semantics.
pub trait KeyOps: Send + Sync {
    fn hash(&self, key: Handle) -> Result<u64, HostError>;
    fn eql(&self, a: Handle, b: Handle) -> Result<bool, HostError>;
}

/// Keys compared by raw handle bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKeys;

impl KeyOps for IdentityKeys {
    #[inline]
    fn hash(&self, key: Handle) -> Result<u64, HostError> {
        Ok(FxBuildHasher.hash_one(key.to_raw()))
    }

    #[inline]
    fn eql(&self, a: Handle, b: Handle) -> Result<bool, HostError> {
        Ok(a == b)
    }
}

/// Key semantics supplied as C callbacks: `hash(ctx, key, 0, out)` and
/// `eql(ctx, a, b, out)` with `*out` non-zero for equal keys.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExternKeyOps {
    pub hash: HostCallback,
    pub eql: HostCallback,
}

impl KeyOps for ExternKeyOps {
    fn hash(&self, key: Handle) -> Result<u64, HostError> {
        self.hash.call(key.to_raw(), 0)
    }

    fn eql(&self, a: Handle, b: Handle) -> Result<bool, HostError> {
        self.eql.call2(a, b).map(|equal| equal != 0)
    }
}

type Bucket = SmallVec<[(Handle, Handle); 1]>;
type Table = FxHashMap<u64, Bucket>;

struct Shard {
    table: RwLock<Table>,
    /// Host callbacks running while this shard's table lock is held.
    callbacks: Mutex<usize>,
}

/// Marks a host callback in progress on a shard. Dropping it blocks while a
/// trace is reading the table without its lock.
struct InCallback<'a>(&'a Mutex<usize>);

impl<'a> InCallback<'a> {
    fn enter(callbacks: &'a Mutex<usize>) -> Self {
        *callbacks.lock() += 1;
        Self(callbacks)
    }
}

impl Drop for InCallback<'_> {
    fn drop(&mut self) {
        *self.0.lock() -= 1;
    }
}

impl Shard {
    fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            callbacks: Mutex::new(0),
        }
    }

    /// Index of `key` within `bucket`, asking the host to compare keys.
    fn position<O: KeyOps>(&self, ops: &O, bucket: &[(Handle, Handle)], key: Handle) -> Result<Option<usize>, HostError> {
        if bucket.is_empty() {
            return Ok(None);
        }
        let _callback = InCallback::enter(&self.callbacks);
        for (index, (stored, _)) in bucket.iter().enumerate() {
            if ops.eql(key, *stored)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn trace(&self, tracer: &mut dyn Tracer) {
        loop {
            if let Some(table) = self.table.try_read_for(TRACE_POLL) {
                mark_table(&table, tracer);
                return;
            }
            let callbacks = self.callbacks.lock();
            if *callbacks > 0 {
                // SAFETY: the lock holder is inside a host callback and
                // cannot leave it, and so cannot write, while `callbacks` is
                // held here.
                let table = unsafe { &*self.table.data_ptr() };
                mark_table(table, tracer);
                return;
            }
        }
    }
}

fn mark_table(table: &Table, tracer: &mut dyn Tracer) {
    for bucket in table.values() {
        for (key, value) in bucket {
            tracer.mark(*key);
            tracer.mark(*value);
        }
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static CLAIMED_SHARDS: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

const ALL_SHARDS: usize = usize::MAX;

/// Debug-build record of the shards this thread is operating on.
struct ShardClaim;

impl ShardClaim {
    fn new(map: usize, shard: usize) -> Self {
        #[cfg(debug_assertions)]
        CLAIMED_SHARDS.with(|claimed| {
            let mut claimed = claimed.borrow_mut();
            let conflict = claimed.iter().any(|&(m, s)| {
                m == map && (s == shard || s == ALL_SHARDS || shard == ALL_SHARDS)
            });
            assert!(!conflict, "reentrant ConcurrentMap call from inside a host callback");
            claimed.push((map, shard));
        });
        #[cfg(not(debug_assertions))]
        let _ = (map, shard);
        ShardClaim
    }
}

impl Drop for ShardClaim {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        CLAIMED_SHARDS.with(|claimed| {
            claimed.borrow_mut().pop();
        });
    }
}

pub struct ConcurrentMap<O: KeyOps = IdentityKeys> {
    shards: Box<[Shard]>,
    ops: O,
}

impl<O: KeyOps> ConcurrentMap<O> {
    /// Empty map with the configured shard count, rounded up to a power of two.
    pub fn new(ops: O) -> Self {
        let shards = global_config().map_shards.max(1).next_power_of_two();
        Self::build(ops, shards)
    }

    pub fn with_shards(ops: O, shards: usize) -> Result<Self, SyncError> {
        if !shards.is_power_of_two() {
            return Err(SyncError::InvalidCapacity {
                capacity: shards,
                reason: "shard count must be a power of two",
            });
        }
        Ok(Self::build(ops, shards))
    }

    fn build(ops: O, shards: usize) -> Self {
        let shards = (0..shards).map(|_| Shard::new()).collect();
        Self { shards, ops }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn key_ops(&self) -> &O {
        &self.ops
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn shard_index(&self, hash: u64) -> usize {
        // Host hashes are often weak in the low bits.
        let mixed = hash.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (mixed >> 32) as usize & (self.shards.len() - 1)
    }

    /// Current value for `key`, or `fallback` if absent.
    pub fn get(&self, key: Handle, fallback: Handle) -> Result<Handle, HostError> {
        Ok(self.lookup(key)?.unwrap_or(fallback))
    }

    pub fn lookup(&self, key: Handle) -> Result<Option<Handle>, HostError> {
        let hash = self.ops.hash(key)?;
        let index = self.shard_index(hash);
        let _claim = ShardClaim::new(self.id(), index);
        let shard = &self.shards[index];

        let table = shard.table.read();
        let Some(bucket) = table.get(&hash) else {
            return Ok(None);
        };
        Ok(shard.position(&self.ops, bucket, key)?.map(|pos| bucket[pos].1))
    }

    /// Insert or overwrite.
    pub fn set(&self, key: Handle, value: Handle) -> Result<(), HostError> {
        let hash = self.ops.hash(key)?;
        let index = self.shard_index(hash);
        let _claim = ShardClaim::new(self.id(), index);
        let shard = &self.shards[index];

        let mut table = shard.table.write();
        let existing = match table.get(&hash) {
            Some(bucket) => shard.position(&self.ops, bucket, key)?,
            None => None,
        };
        let bucket = table.entry(hash).or_default();
        match existing {
            Some(pos) => bucket[pos].1 = value,
            None => bucket.push((key, value)),
        }
        Ok(())
    }

    /// Remove every entry. All shards are write-locked at once, so no reader
    /// sees some shards cleared and others not.
    pub fn clear(&self) {
        let _claim = ShardClaim::new(self.id(), ALL_SHARDS);
        let mut tables: SmallVec<[_; 16]> = self.shards.iter().map(|shard| shard.table.write()).collect();
        for table in tables.iter_mut() {
            table.clear();
        }
    }

    /// Replace the value for `key` with `modify(current)`, where a missing key
    /// reads as `fallback`, and return the stored value.
    ///
    /// The shard stays write-locked across the read, the call and the store.
    /// If `modify` fails nothing is written.
    pub fn fetch_and_modify<F>(&self, key: Handle, fallback: Handle, modify: F) -> Result<Handle, HostError>
    where
        F: FnOnce(Handle) -> Result<Handle, HostError>,
    {
        let hash = self.ops.hash(key)?;
        let index = self.shard_index(hash);
        let _claim = ShardClaim::new(self.id(), index);
        let shard = &self.shards[index];

        let mut table = shard.table.write();
        let existing = match table.get(&hash) {
            Some(bucket) => shard
                .position(&self.ops, bucket, key)?
                .map(|pos| (pos, bucket[pos].1)),
            None => None,
        };
        let old = existing.map_or(fallback, |(_, value)| value);

        let new = {
            let _callback = InCallback::enter(&shard.callbacks);
            modify(old)?
        };

        let bucket = table.entry(hash).or_default();
        match existing {
            Some((pos, _)) => bucket[pos].1 = new,
            None => bucket.push((key, new)),
        }
        Ok(new)
    }

    /// Number of entries. Shards are counted one at a time, so the result is
    /// only exact when no other thread is writing.
    pub fn len(&self) -> usize {
        let _claim = ShardClaim::new(self.id(), ALL_SHARDS);
        self.shards
            .iter()
            .map(|shard| shard.table.read().values().map(|bucket| bucket.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConcurrentMap<IdentityKeys> {
    fn default() -> Self {
        Self::new(IdentityKeys)
    }
}

impl<O: KeyOps> Trace for ConcurrentMap<O> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for shard in self.shards.iter() {
            shard.trace(tracer);
        }
    }
}

impl<O: KeyOps> Shareable for ConcurrentMap<O> {}

impl<O: KeyOps> fmt::Debug for ConcurrentMap<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

pub type HostMap = ConcurrentMap<ExternKeyOps>;

/// Create a map with host key semantics. A `shards` of 0 uses the configured
/// count; a count that is not a power of two returns null.
#[unsafe(no_mangle)]
pub extern "C" fn hostsync_map_new(hash: HostCallback, eql: HostCallback, shards: usize) -> *mut HostMap {
    let ops = ExternKeyOps { hash, eql };
    if shards == 0 {
        return into_shared(ConcurrentMap::new(ops));
    }
    match ConcurrentMap::with_shards(ops, shards) {
        Ok(map) => into_shared(map),
        Err(e) => {
            tracing::error!(error = %e, "hostsync_map_new rejected its arguments");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_free(map: *mut HostMap) {
    unsafe { free_shared(map) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_mark(map: *const HostMap, mark: MarkFn) {
    unsafe { mark_shared(map, mark) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_get(
    map: *const HostMap,
    key: u64,
    fallback: u64,
    out_value: *mut u64,
    out_error: *mut u64,
) -> i32 {
    let Some(map) = (unsafe { map.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    match map.get(Handle::from_raw(key), Handle::from_raw(fallback)) {
        Ok(value) => {
            unsafe { write_handle(out_value, value) };
            HOSTSYNC_OK
        }
        Err(e) => unsafe { write_host_error(out_error, &e) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_set(map: *const HostMap, key: u64, value: u64, out_error: *mut u64) -> i32 {
    let Some(map) = (unsafe { map.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    match map.set(Handle::from_raw(key), Handle::from_raw(value)) {
        Ok(()) => HOSTSYNC_OK,
        Err(e) => unsafe { write_host_error(out_error, &e) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_clear(map: *const HostMap) -> i32 {
    let Some(map) = (unsafe { map.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    map.clear();
    HOSTSYNC_OK
}

/// `modify` is called as `modify(ctx, old, 0, out)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_fetch_and_modify(
    map: *const HostMap,
    key: u64,
    fallback: u64,
    modify: HostCallback,
    out_value: *mut u64,
    out_error: *mut u64,
) -> i32 {
    let Some(map) = (unsafe { map.as_ref() }) else {
        return HOSTSYNC_UNINITIALIZED;
    };
    let result = map.fetch_and_modify(Handle::from_raw(key), Handle::from_raw(fallback), |old| modify.call1(old));
    match result {
        Ok(value) => {
            unsafe { write_handle(out_value, value) };
            HOSTSYNC_OK
        }
        Err(e) => unsafe { write_host_error(out_error, &e) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_map_len(map: *const HostMap) -> usize {
    match unsafe { map.as_ref() } {
        Some(map) => map.len(),
        None => 0,
    }
}
