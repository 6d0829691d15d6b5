// SPDX-License-Identifier: Apache-2.0

use crate::item::Status;

use std::fmt::{Display, Formatter};
use std::io;

/// Error returned by the arena and the switchless machinery
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An argument was rejected before anything was touched
    InvalidParameter(&'static str),

    /// Switchless calls have already been set up for this Keep
    AlreadyInitialized,

    /// A call was posted before the switchless manager was started
    NotInitialized,

    /// Every worker was busy and the call was not posted
    ///
    /// This is not a failure: the caller is expected to fall back to a
    /// regular boundary crossing.
    Busy,

    /// The requested arena capacity is above the configured ceiling
    CapacityTooLarge {
        /// the requested capacity in bytes
        requested: usize,
        /// the ceiling in bytes
        max: usize,
    },

    /// The arena has no room left for the allocation
    OutOfMemory,

    /// A size computation overflowed
    Overflow,

    /// Reserving a memory mapping failed
    Map(io::Error),

    /// Spawning a worker thread failed
    Spawn(io::Error),

    /// Data coming from the untrusted side failed validation
    Untrusted(&'static str),

    /// The host function completed with a non-OK status
    Host(Status),

    /// The configuration could not be parsed or is inconsistent
    Config(String),
}

impl Error {
    /// Whether this is the "all workers busy" outcome
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::AlreadyInitialized => write!(f, "switchless calls are already initialized"),
            Self::NotInitialized => write!(
                f,
                "switchless calls are not initialized, was the switchless manager started?"
            ),
            Self::Busy => write!(f, "all switchless workers are busy"),
            Self::CapacityTooLarge { requested, max } => write!(
                f,
                "arena capacity of {requested} bytes exceeds the maximum of {max} bytes"
            ),
            Self::OutOfMemory => write!(f, "arena capacity exhausted"),
            Self::Overflow => write!(f, "size computation overflowed"),
            Self::Map(e) => write!(f, "failed to map memory: {e}"),
            Self::Spawn(e) => write!(f, "failed to spawn switchless worker: {e}"),
            Self::Untrusted(msg) => write!(f, "untrusted input rejected: {msg}"),
            Self::Host(status) => write!(f, "host call failed with status {status:?}"),
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(e) | Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::CapacityTooLarge {
                requested: 2048,
                max: 1024
            }
            .to_string(),
            "arena capacity of 2048 bytes exceeds the maximum of 1024 bytes"
        );
        assert_eq!(
            Error::Host(Status::NotFound).to_string(),
            "host call failed with status NotFound"
        );
    }

    #[test]
    fn busy_is_distinct() {
        assert!(Error::Busy.is_busy());
        assert!(!Error::NotInitialized.is_busy());
        assert!(!Error::AlreadyInitialized.is_busy());
    }

    #[test]
    fn source() {
        use std::error::Error as _;

        let err = Error::Spawn(io::Error::from_raw_os_error(libc::EAGAIN));
        assert!(err.source().is_some());
        assert!(Error::OutOfMemory.source().is_none());
    }
}
