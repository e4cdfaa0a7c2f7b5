///
/// Host Callbacks and Status Codes
///
/// Containers call back into the host for key hashing and equality, for
/// creating pooled items and for computing `fetch_and_modify` results. Over
/// the C boundary every such callback has the same shape:
///
/// ```c
/// int32_t callback(void *ctx, uint64_t a, uint64_t b, uint64_t *out);
/// ```
///
/// A zero return means success with the result written to `*out`. Any other
/// return means the callback raised; `*out` then holds the host exception,
/// which we hand back to the caller of the outer operation untouched.
///
/// Unused arguments are passed as 0: `factory(ctx, 0, 0, out)`,
/// `hash(ctx, key, 0, out)`, `modify(ctx, old, 0, out)`,
/// `eql(ctx, a, b, out)` with `*out` = 0 or 1.
///

use std::ffi::c_void;

use crate::handle::{Handle, HostError};

pub const HOSTSYNC_OK: i32 = 0;
/// Sentinel outcome: queue full or empty, checkout timed out, key absent.
pub const HOSTSYNC_NONE: i32 = 1;
/// A host callback raised; the exception is in the error out-parameter.
pub const HOSTSYNC_HOST_ERROR: i32 = 2;
/// The call broke the container's protocol (e.g. checkin of a free slot).
pub const HOSTSYNC_MISUSE: i32 = 3;
/// The container pointer was null (allocated but never initialized).
pub const HOSTSYNC_UNINITIALIZED: i32 = 4;

pub type HostFn = unsafe extern "C" fn(ctx: *mut c_void, a: u64, b: u64, out: *mut u64) -> i32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostCallback {
    pub func: HostFn,
    pub ctx: *mut c_void,
}

// SAFETY: the host guarantees a callback may be invoked from any thread that
// holds its execution lock, which is the only way containers invoke it.
unsafe impl Send for HostCallback {}
unsafe impl Sync for HostCallback {}

impl HostCallback {
    pub fn new(func: HostFn, ctx: *mut c_void) -> Self {
        Self { func, ctx }
    }

    pub fn call(&self, a: u64, b: u64) -> Result<u64, HostError> {
        let mut out = 0u64;
        let status = unsafe { (self.func)(self.ctx, a, b, &mut out) };
        if status == HOSTSYNC_OK {
            Ok(out)
        } else {
            Err(HostError::new(Handle::from_raw(out)))
        }
    }

    pub fn call0(&self) -> Result<Handle, HostError> {
        self.call(0, 0).map(Handle::from_raw)
    }

    pub fn call1(&self, arg: Handle) -> Result<Handle, HostError> {
        self.call(arg.to_raw(), 0).map(Handle::from_raw)
    }

    pub fn call2(&self, a: Handle, b: Handle) -> Result<u64, HostError> {
        self.call(a.to_raw(), b.to_raw())
    }
}

impl std::fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallback")
            .field("func", &(self.func as *const c_void))
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Write a host error into a C out-parameter, ignoring null pointers.
///
/// # Safety
///
/// `out_error` must be null or valid for a `u64` write.
pub unsafe fn write_host_error(out_error: *mut u64, err: &HostError) -> i32 {
    if !out_error.is_null() {
        unsafe { *out_error = err.exception().to_raw() };
    }
    HOSTSYNC_HOST_ERROR
}

/// Write a handle into a C out-parameter, ignoring null pointers.
///
/// # Safety
///
/// `out` must be null or valid for a `u64` write.
pub unsafe fn write_handle(out: *mut u64, handle: Handle) {
    if !out.is_null() {
        unsafe { *out = handle.to_raw() };
    }
}
