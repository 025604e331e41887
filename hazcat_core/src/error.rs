//! Unified error handling for hazcat
//!
//! This module provides a centralized error type for the whole transport,
//! ensuring consistent error handling across allocators, the registry and
//! the shared message queue.

use thiserror::Error;

/// Main error type for hazcat operations
#[derive(Debug, Error)]
pub enum HazcatError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input/argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocator ran out of ring slots.
    ///
    /// `Allocator::allocate` reports a full ring as `None`, not as this
    /// error; this variant is raised where a full allocator makes an
    /// operation impossible (loaning a sample, copying on take).
    #[error("Allocator out of space: {0}")]
    NoSpace(String),

    /// A topic already carries `DOMAINS_PER_TOPIC` memory domains
    #[error("Too many memory domains on topic '{0}'")]
    TooManyDomains(String),

    /// Advisory file lock could not be acquired or released
    #[error("Lock failure: {0}")]
    LockFailure(String),

    /// Shared memory segment creation, attachment or layout errors
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// Accelerator/device errors (CUDA runtime or driver)
    #[error("Device error: {0}")]
    Device(String),

    /// Endpoint count overflow or underflow on a shared queue
    #[error("Endpoint count error: {0}")]
    CountOverflow(String),
}

/// Convenience type alias for Results using HazcatError
pub type HazcatResult<T> = std::result::Result<T, HazcatError>;

// Helper methods
impl HazcatError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        HazcatError::InvalidArgument(msg.into())
    }

    /// Create a shared memory error
    pub fn shared_memory<S: Into<String>>(msg: S) -> Self {
        HazcatError::SharedMemory(msg.into())
    }

    /// Create a shared memory error from the current OS errno
    pub fn shared_memory_os<S: Into<String>>(msg: S) -> Self {
        HazcatError::SharedMemory(format!(
            "{}: {}",
            msg.into(),
            std::io::Error::last_os_error()
        ))
    }

    /// Create a device error
    pub fn device<S: Into<String>>(msg: S) -> Self {
        HazcatError::Device(msg.into())
    }

    /// Create a lock failure error from the current OS errno
    pub fn lock_failure_os<S: Into<String>>(msg: S) -> Self {
        HazcatError::LockFailure(format!(
            "{}: {}",
            msg.into(),
            std::io::Error::last_os_error()
        ))
    }

    /// Create a no-space error
    pub fn no_space<S: Into<String>>(msg: S) -> Self {
        HazcatError::NoSpace(msg.into())
    }
}
