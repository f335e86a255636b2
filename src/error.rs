//! Error types
//!
//! Recoverable errors propagate as `Err(Error)` through Rust call frames. An
//! arbitrary thrown language value travels as `Error::Thrown`, with the value
//! itself parked in the context's counted `thrown` slot so it stays alive
//! while the error unwinds. Native error variants are turned into error
//! objects (with `name` and `message`) only when something catches them.

use thiserror::Error;

/// Errors produced by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An allocation failed, even after an emergency collection
    #[error("out of memory")]
    OutOfMemory,

    /// Stack, recursion or prototype-chain limits exceeded; invalid indices
    #[error("RangeError: {0}")]
    Range(String),

    /// Wrong kind of value for the requested operation
    #[error("TypeError: {0}")]
    Type(String),

    /// Unresolvable identifier
    #[error("ReferenceError: {0}")]
    Reference(String),

    /// Invariant violation or stale handle
    #[error("InternalError: {0}")]
    Internal(String),

    /// A language value was thrown; see `Context::take_thrown`
    #[error("uncaught exception")]
    Thrown,
}

impl Error {
    pub fn range(msg: impl Into<String>) -> Self {
        Error::Range(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }

    pub fn reference(msg: impl Into<String>) -> Self {
        Error::Reference(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub(crate) fn invalid_handle() -> Self {
        Error::Internal("invalid handle".into())
    }

    pub(crate) fn invalid_index() -> Self {
        Error::Range("invalid stack index".into())
    }

    /// The `name` an error object created from this error carries
    pub fn class_name(&self) -> &'static str {
        match self {
            Error::OutOfMemory => "Error",
            Error::Range(_) => "RangeError",
            Error::Type(_) => "TypeError",
            Error::Reference(_) => "ReferenceError",
            Error::Internal(_) => "InternalError",
            Error::Thrown => "Error",
        }
    }

    /// The `message` an error object created from this error carries
    pub fn message(&self) -> &str {
        match self {
            Error::OutOfMemory => "out of memory",
            Error::Range(m) | Error::Type(m) | Error::Reference(m) | Error::Internal(m) => m,
            Error::Thrown => "",
        }
    }
}

/// Result type used throughout the runtime
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == CallStatus::Success
    }
}

/// Host callback for unrecoverable conditions. Must not return.
pub type FatalHandler = fn(&str) -> !;

/// Default fatal handler: log and abort the process
pub fn default_fatal_handler(msg: &str) -> ! {
    tracing::error!(message = msg, "fatal runtime error");
    std::process::abort()
}
