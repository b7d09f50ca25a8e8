//! Error types for gpio-brokerd

use std::fmt;
use thiserror::Error;

/// Classification of a line access adapter failure.
///
/// Mirrors the errno values the kernel character device hands back so the
/// message can be surfaced to clients unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// A requested line is already held by another request (EBUSY)
    Busy,
    /// Malformed or inconsistent request (EINVAL)
    InvalidArgument,
    /// More lines than a single request may hold (E2BIG)
    TooManyLines,
    /// Operation not allowed in the line's current configuration (EPERM)
    PermissionDenied,
    /// The request has already been released
    Released,
    /// The chip or line no longer exists (ENODEV/ENOENT)
    NotFound,
    /// Any other OS error
    Os(i32),
}

impl AdapterErrorKind {
    /// Errno-style numeric code for the failure
    pub fn code(&self) -> i32 {
        match self {
            AdapterErrorKind::Busy => libc::EBUSY,
            AdapterErrorKind::InvalidArgument => libc::EINVAL,
            AdapterErrorKind::TooManyLines => libc::E2BIG,
            AdapterErrorKind::PermissionDenied => libc::EPERM,
            AdapterErrorKind::Released => libc::EBADF,
            AdapterErrorKind::NotFound => libc::ENODEV,
            AdapterErrorKind::Os(errno) => *errno,
        }
    }
}

/// Failure reported by the line access adapter.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AdapterError {
    /// What went wrong
    pub kind: AdapterErrorKind,
    /// Human readable message, passed to clients verbatim
    pub message: String,
}

impl AdapterError {
    /// Create a new adapter error
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Line busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Busy, message)
    }

    /// Invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidArgument, message)
    }

    /// Request already released
    pub fn released() -> Self {
        Self::new(AdapterErrorKind::Released, "request has been released")
    }

    /// Chip or line gone
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::NotFound, message)
    }

    /// Errno-style numeric code
    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

/// Result type for adapter operations
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Broker daemon errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Malformed method arguments, rejected before any hardware call
    #[error("{0}")]
    InvalidArgs(String),

    /// Line request rejected by the adapter
    #[error("{0}")]
    RequestFailed(AdapterError),

    /// Reconfiguration rejected by the adapter
    #[error("{0}")]
    ReconfigureFailed(AdapterError),

    /// Reading line values failed
    #[error("{0}")]
    GetValuesFailed(AdapterError),

    /// Writing line values failed
    #[error("{0}")]
    SetValuesFailed(AdapterError),

    /// No object is exported at the path
    #[error("No such object: {0}")]
    UnknownObject(String),

    /// The object does not implement the method
    #[error("No such method '{method}' on object {path}")]
    UnknownMethod {
        /// Object path
        path: String,
        /// Method name
        method: String,
    },

    /// Broker bookkeeping is inconsistent; always fatal
    #[error("Internal consistency error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Hotplug monitor error
    #[error("Hotplug error: {0}")]
    Hotplug(String),

    /// Bus front end error
    #[error("Bus error: {0}")]
    Bus(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Create an internal consistency error
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    /// Create an invalid arguments error
    pub fn invalid_args(message: impl fmt::Display) -> Self {
        Self::InvalidArgs(message.to_string())
    }

    /// Returns true for errors that indicate a broker bug
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Internal(_))
    }

    /// The adapter error behind a hardware failure, if any
    pub fn adapter_error(&self) -> Option<&AdapterError> {
        match self {
            BrokerError::RequestFailed(e)
            | BrokerError::ReconfigureFailed(e)
            | BrokerError::GetValuesFailed(e)
            | BrokerError::SetValuesFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Error name reported to bus clients
    pub fn bus_name(&self) -> &'static str {
        match self {
            BrokerError::InvalidArgs(_) => "broker.Error.InvalidArgs",
            BrokerError::UnknownObject(_) => "broker.Error.UnknownObject",
            BrokerError::UnknownMethod { .. } => "broker.Error.UnknownMethod",
            BrokerError::RequestFailed(_) => "broker.RequestFailed",
            BrokerError::ReconfigureFailed(_) => "broker.ReconfigureFailed",
            BrokerError::GetValuesFailed(_) => "broker.GetValuesFailed",
            BrokerError::SetValuesFailed(_) => "broker.SetValuesFailed",
            _ => "broker.Error.Failed",
        }
    }
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
