//! Process-wide initialization. Kept in its own test binary because the
//! configuration and the logger can only be installed once per process.

use std::ffi::CString;
use std::io::Write;
use std::time::Duration;

use hostsync_runtime::{
    HOSTSYNC_MISUSE, HOSTSYNC_OK, HostCallback, global_config, hostsync_init,
    hostsync_init_from_file, hostsync_pool_free, hostsync_pool_new,
};

unsafe extern "C" fn make(_ctx: *mut std::ffi::c_void, _a: u64, _b: u64, out: *mut u64) -> i32 {
    unsafe { *out = 1 };
    HOSTSYNC_OK
}

#[test]
fn test_init_from_file_installs_config_once() {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "pool_timeout_ms = 250").unwrap();
    writeln!(file, "map_shards = 32").unwrap();
    writeln!(file, "log_filter = \"hostsync_primitives=debug\"").unwrap();

    let path = CString::new(file.path().to_str().unwrap()).unwrap();
    assert_eq!(unsafe { hostsync_init_from_file(path.as_ptr()) }, HOSTSYNC_OK);

    assert_eq!(global_config().pool_timeout(), Duration::from_millis(250));
    assert_eq!(global_config().map_shards, 32);

    // A negative timeout picks up the installed default.
    let pool = hostsync_pool_new(1, -1, HostCallback::new(make, std::ptr::null_mut()));
    assert_eq!(unsafe { (*pool).timeout() }, Duration::from_millis(250));
    unsafe { hostsync_pool_free(pool) };

    assert_eq!(hostsync_init(), HOSTSYNC_MISUSE);
    assert_eq!(unsafe { hostsync_init_from_file(path.as_ptr()) }, HOSTSYNC_MISUSE);
}
