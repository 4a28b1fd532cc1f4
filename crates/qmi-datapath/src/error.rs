//! Error types for data-path operations.

use std::fmt;
use std::io;
use std::time::Duration;

/// Result type for data-path operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level error codes reported by the device.
///
/// The device-side encoding is owned by the transport collaborator; only
/// the codes this crate reacts to are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolError {
    /// A mandatory TLV was not present in the request.
    MissingArgument,
    /// A TLV carried a value the device does not accept.
    InvalidArgument,
    /// The request or service is not supported by the device.
    NotSupported,
    /// Any other numeric protocol error.
    Other(u16),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgument => f.write_str("missing-argument"),
            Self::InvalidArgument => f.write_str("invalid-argument"),
            Self::NotSupported => f.write_str("not-supported"),
            Self::Other(code) => write!(f, "protocol error {}", code),
        }
    }
}

/// Errors that can occur while configuring the data path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket or sysfs operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// The netlink channel could not be set up at startup.
    #[error("netlink support not available: {0}")]
    Unavailable(String),

    /// A request got no answer in time.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The device answered with a protocol error.
    #[error("{operation} failed: {code}")]
    Protocol {
        /// The request that failed.
        operation: String,
        /// Protocol error reported by the device.
        code: ProtocolError,
    },

    /// The device or kernel accepted the request but did not apply the
    /// requested value.
    #[error("requested value rejected: {0}")]
    Rejected(String),

    /// Another open/close/data format operation is running on the port.
    #[error("operation in progress: {0}")]
    Busy(String),

    /// The port is not in a state that allows the operation.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// The resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Every link in the preallocated pool is in use.
    #[error("no free link left in pool of {capacity}")]
    Exhausted {
        /// Number of links in the pool.
        capacity: usize,
    },

    /// The request conflicts with resources still in use.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A preallocated pool was asked to serve a different main interface.
    #[error("link pool is bound to {expected}, not {actual}")]
    WrongInterface {
        /// Interface the pool was created for.
        expected: String,
        /// Interface named in the request.
        actual: String,
    },

    /// Link pool initialization failed for a queued caller.
    #[error("link pool initialization failed: {0}")]
    PoolInit(String),

    /// Operation not supported by the driver or device.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}

impl Error {
    /// Create a kernel error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a device protocol error.
    pub fn protocol(operation: impl Into<String>, code: ProtocolError) -> Self {
        Self::Protocol {
            operation: operation.into(),
            code,
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, unknown link).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, 2 | 19) // ENOENT=2, ENODEV=19
            }
            Self::NotFound(_) => true,
            _ => false,
        }
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the port was busy with another operation.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => *errno == 16, // EBUSY
            _ => false,
        }
    }

    /// Check if the device or kernel refused a requested value.
    pub fn is_protocol_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Protocol { .. })
    }

    /// Check if the device complained about a missing mandatory argument.
    pub fn is_missing_argument(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                code: ProtocolError::MissingArgument,
                ..
            }
        )
    }

    /// Check if this error reports a resource conflict.
    pub fn is_resource_conflict(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. }
                | Self::AlreadyExists(_)
                | Self::Conflict(_)
                | Self::WrongInterface { .. }
        )
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
