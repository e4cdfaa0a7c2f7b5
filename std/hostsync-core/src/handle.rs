//!
//! Host Value Handles
//!
//! A `Handle` is an opaque 64-bit reference to a value owned by the host's
//! memory manager. Containers copy handles in and out, compare them by
//! identity or through host callbacks, and report them during GC traces.
//! They never dereference or free them: when a container is dropped, the
//! handles it held simply revert to the collector.
//!

use std::fmt;

use thiserror::Error;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// An exception raised by a host callback (hash, eql, factory or modify).
///
/// Carries the host's exception value so the binding can re-raise it once
/// control is back on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Host callback raised {exception:?}")]
pub struct HostError {
    exception: Handle,
}

impl HostError {
    pub const fn new(exception: Handle) -> Self {
        Self { exception }
    }

    pub const fn exception(&self) -> Handle {
        self.exception
    }
}
