//! stderr logger for the runtime library.
//!
//! Output goes to stderr without ANSI colors, since the host usually owns
//! stdout and may redirect stderr to a file.

use hostsync_core::SyncError;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber with the given filter directive
/// (e.g. `"warn"` or `"hostsync_primitives=debug"`). Fails if the directive
/// does not parse or a subscriber is already installed.
pub fn init_logging(filter: &str) -> Result<(), SyncError> {
    install_logging(parse_filter(filter)?)
}

pub fn parse_filter(filter: &str) -> Result<EnvFilter, SyncError> {
    EnvFilter::try_new(filter).map_err(|e| SyncError::Logging(e.to_string()))
}

/// Fails only if a subscriber is already installed.
pub fn install_logging(filter: EnvFilter) -> Result<(), SyncError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| SyncError::Logging(e.to_string()))
}
