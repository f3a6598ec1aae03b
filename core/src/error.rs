//! # Engine Error Handling
//!
//! Error handling in the engine follows these principles:
//! - Errors are typed, `Copy` and `no_std` compatible
//! - Ownership violations are reported as [`Error::ConsistencyFault`], never
//!   silently absorbed
//! - Spurious interrupts are an outcome, not an error

use core::fmt;

use dmachain_hal::HalError;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Engine result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Engine error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Command-block pool or fragment synthesis ran out of memory
    AllocationFailure,
    /// A fragment could not be linked into an operation
    MergeFailure,
    /// Fragment or operation ownership rules were broken
    ConsistencyFault(Fault),
    /// The collaborator gave up waiting for the hardware
    HardwareTimeout,
    /// Operation is not in a state that allows the request
    InvalidState,
    /// Invalid parameter provided
    InvalidParameter,
    /// A transform could not be applied
    Transform(&'static str),
    /// Operation not supported by this configuration
    NotSupported,
    /// Engine was shut down with the operation still queued
    Shutdown,
    /// Lower-level HAL failure
    Hal(HalError),
}

/// Kinds of ownership violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fragment returned without an owning cache
    UnownedFragment,
    /// Fragment returned to a cache that did not create it
    ForeignCache,
    /// Fragment returned while not on loan (second return)
    NotActive,
    /// Operation handle refers to a released operation
    StaleOperation,
    /// Cache id not registered
    UnknownCache,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure => write!(f, "allocation failure"),
            Self::MergeFailure => write!(f, "fragment merge failed"),
            Self::ConsistencyFault(fault) => write!(f, "consistency fault: {}", fault),
            Self::HardwareTimeout => write!(f, "hardware timeout"),
            Self::InvalidState => write!(f, "invalid operation state"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Transform(what) => write!(f, "transform failed: {}", what),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Shutdown => write!(f, "engine shut down"),
            Self::Hal(e) => write!(f, "HAL error: {}", e),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnownedFragment => write!(f, "fragment has no owning cache"),
            Self::ForeignCache => write!(f, "fragment belongs to another cache"),
            Self::NotActive => write!(f, "fragment returned while idle"),
            Self::StaleOperation => write!(f, "stale operation handle"),
            Self::UnknownCache => write!(f, "unknown fragment cache"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::ConsistencyFault(fault)
    }
}

impl From<HalError> for Error {
    fn from(e: HalError) -> Self {
        match e {
            HalError::PoolExhausted => Error::AllocationFailure,
            other => Error::Hal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_is_allocation_failure() {
        assert_eq!(Error::from(HalError::PoolExhausted), Error::AllocationFailure);
        assert_eq!(Error::from(HalError::DoubleFree), Error::Hal(HalError::DoubleFree));
    }

    #[test]
    fn test_fault_display() {
        let err = Error::from(Fault::NotActive);
        assert_eq!(err.to_string(), "consistency fault: fragment returned while idle");
    }
}
