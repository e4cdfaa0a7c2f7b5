///
/// hostsync Runtime Static Library
///
/// The library a host extension links against. It re-exports every
/// `hostsync_*` symbol from the primitive crates and adds process setup:
///
/// - `hostsync_init()` - configuration from `HOSTSYNC_*` variables, then logging
/// - `hostsync_init_from_file(path)` - configuration from a TOML file
/// - `hostsync_version()` - library version as a C string
///
/// Initialization is optional. Without it every container uses the default
/// configuration and nothing is logged.
///

pub mod logging;

use std::ffi::{CStr, c_char};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub use hostsync_core::*;
pub use hostsync_primitives::*;

pub use logging::{init_logging, install_logging, parse_filter};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install `config` as the process-wide configuration and start logging
/// with its filter. Succeeds once per process.
///
/// If the process already has a `tracing` subscriber, it is kept and
/// receives the runtime's events.
pub fn init(config: SyncConfig) -> Result<(), SyncError> {
    config.validate()?;
    let filter = parse_filter(&config.log_filter)?;
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(SyncError::InvalidConfig("hostsync runtime is already initialized".to_string()));
    }
    if !install_config(config) {
        tracing::warn!("configuration was read before initialization; keeping the earlier values");
    }
    if let Err(e) = install_logging(filter) {
        tracing::warn!(error = %e, "keeping the tracing subscriber already installed");
    }
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "hostsync runtime initialized");
    Ok(())
}

fn init_status(result: Result<(), SyncError>) -> i32 {
    match result {
        Ok(()) => HOSTSYNC_OK,
        Err(e) => {
            tracing::error!(error = %e, "hostsync initialization failed");
            HOSTSYNC_MISUSE
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn hostsync_init() -> i32 {
    init_status(init(SyncConfig::from_env()))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostsync_init_from_file(path: *const c_char) -> i32 {
    if path.is_null() {
        return HOSTSYNC_MISUSE;
    }
    let path = unsafe { CStr::from_ptr(path) };
    let Ok(path) = path.to_str() else {
        return HOSTSYNC_MISUSE;
    };
    init_status(SyncConfig::from_path(Path::new(path)).and_then(init))
}

#[unsafe(no_mangle)]
pub extern "C" fn hostsync_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_a_c_string() {
        let version = unsafe { CStr::from_ptr(hostsync_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_init_from_file_rejects_bad_paths() {
        assert_eq!(unsafe { hostsync_init_from_file(std::ptr::null()) }, HOSTSYNC_MISUSE);
        let missing = c"/nonexistent/hostsync.toml";
        assert_eq!(unsafe { hostsync_init_from_file(missing.as_ptr()) }, HOSTSYNC_MISUSE);
    }

    #[test]
    fn test_init_rejects_invalid_config_before_installing() {
        let config = SyncConfig { map_shards: 3, ..SyncConfig::default() };
        assert!(matches!(init(config), Err(SyncError::InvalidConfig(_))));
        assert!(!INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_init_rejects_bad_log_filter_before_installing() {
        let config = SyncConfig { log_filter: "hostsync=loud".to_string(), ..SyncConfig::default() };
        assert!(matches!(init(config), Err(SyncError::Logging(_))));
        assert!(!INITIALIZED.load(Ordering::SeqCst));
    }
}
