//! Error types for device lifecycle and resource management.

use std::fmt;

/// Error type for HCA lifecycle and resource operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The handle does not name a live, registered device.
    InvalidHandle,
    /// A caller-supplied argument failed validation. No side effects occurred.
    InvalidArgument(&'static str),
    /// A conflicting lifecycle operation is in flight, or the device is in
    /// the wrong state for this call. Retry later; never merged with the
    /// operation already running.
    Busy,
    /// The request cannot be satisfied within device limits or available
    /// on-board memory, even after backoff.
    ResourceExhausted,
    /// The wait for the device lock was cancelled before acquisition.
    Interrupted,
    /// A catastrophic hardware condition preempted the operation. Terminal
    /// for this device until a restart completes.
    Fatal,
    /// Command or collaborator failure without a more specific class.
    Failure(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHandle => write!(f, "invalid device handle"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::Busy => write!(f, "device busy: lifecycle operation in flight"),
            Error::ResourceExhausted => write!(f, "resources exhausted"),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::Fatal => write!(f, "catastrophic device error"),
            Error::Failure(what) => write!(f, "operation failed: {}", what),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias for fallible HCA operations.
pub type Result<T> = std::result::Result<T, Error>;
