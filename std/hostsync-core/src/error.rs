///
/// hostsync error types.
///
/// Capacity and contention outcomes (full queue, empty queue, pool timeout)
/// are not errors: they come back as sentinels. `SyncError` covers the rest:
/// host callback failures, invalid construction parameters, misuse of the
/// pool lease protocol, configuration loading and logging setup.
///

use thiserror::Error;

use crate::handle::HostError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Invalid capacity {capacity}: {reason}")]
    InvalidCapacity { capacity: usize, reason: &'static str },

    #[error("Slot {index} is not checked out")]
    NotCheckedOut { index: usize },

    #[error("Slot index {index} out of range for pool of size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("Timed out after {timeout_ms}ms waiting for a pooled item")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to install logging: {0}")]
    Logging(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SyncError {
    /// The host exception behind this error, if a host callback raised.
    pub fn host_exception(&self) -> Option<crate::Handle> {
        match self {
            SyncError::Host(err) => Some(err.exception()),
            _ => None,
        }
    }
}
