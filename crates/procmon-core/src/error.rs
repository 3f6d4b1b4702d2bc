//! Error types for procmon operations.
//!
//! This module defines the error taxonomy shared by every procmon crate:
//! - [`ProcmonError`] - Canonical error type for all procmon operations
//!
//! ## Error Classes
//!
//! - **Fatal**: the environment is broken (process table size query failed,
//!   snapshot retries exhausted). Library code returns [`ProcmonError::Fatal`];
//!   the binary is responsible for terminating with a diagnostic.
//! - **Per-entity**: one process could not be inspected or re-bound. These
//!   surface as `NotFound` / `PermissionDenied` / `System` and are recovered
//!   locally by the caller.
//! - **Unsupported**: the capability is absent from this build or platform.

use std::io;
use thiserror::Error;

// ============================================================================
// Canonical Error Type
// ============================================================================

/// Canonical error type for all procmon operations.
///
/// ## Error Code Mapping
///
/// | Variant | Code |
/// |---------|------|
/// | `InvalidArgument` | 1 |
/// | `PermissionDenied` | 4 |
/// | `NotFound` | 5 |
/// | `NotSupported` | 6 |
/// | `System` | 8 |
/// | `Fatal` | 9 |
/// | `Internal` | 99 |
#[derive(Debug, Error)]
pub enum ProcmonError {
    /// Invalid argument provided.
    ///
    /// Returned when input validation fails (e.g., pid = 0, malformed CPU list).
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was invalid.
        message: String,
    },

    /// Permission denied for the operation.
    #[error("Permission denied for '{operation}' on PID {pid}")]
    PermissionDenied {
        /// The process ID we attempted to operate on.
        pid: u32,
        /// The operation that was denied (e.g., "read task info").
        operation: String,
    },

    /// Target process not found.
    ///
    /// The specified PID does not exist or has already exited.
    #[error("Process {pid} not found")]
    NotFound {
        /// The process ID that was not found.
        pid: u32,
    },

    /// Operation not supported by this build or platform.
    #[error("Operation '{feature}' not supported on {platform}")]
    NotSupported {
        /// The feature that is not supported.
        feature: String,
        /// The platform where it's not supported.
        platform: String,
    },

    /// System-level error with errno context.
    #[error("System error: {message} (errno: {errno})")]
    System {
        /// Description of the error.
        message: String,
        /// The errno value.
        errno: i32,
    },

    /// Unrecoverable environment failure.
    ///
    /// Continuing with inconsistent process data is worse than stopping, so
    /// callers are expected to abort the program when they see this.
    #[error("Fatal error: {message}")]
    Fatal {
        /// Diagnostic shown before exit.
        message: String,
    },

    /// Internal error (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl ProcmonError {
    /// Stable numeric code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            ProcmonError::InvalidArgument { .. } => 1,
            ProcmonError::PermissionDenied { .. } => 4,
            ProcmonError::NotFound { .. } => 5,
            ProcmonError::NotSupported { .. } => 6,
            ProcmonError::System { .. } => 8,
            ProcmonError::Fatal { .. } => 9,
            ProcmonError::Internal { .. } => 99,
        }
    }

    /// True for the class of errors that must terminate the program.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcmonError::Fatal { .. })
    }
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl ProcmonError {
    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ProcmonError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a `PermissionDenied` error.
    pub fn permission_denied(pid: u32, operation: impl Into<String>) -> Self {
        ProcmonError::PermissionDenied {
            pid,
            operation: operation.into(),
        }
    }

    /// Create a `NotFound` error.
    pub fn not_found(pid: u32) -> Self {
        ProcmonError::NotFound { pid }
    }

    /// Create a `NotSupported` error.
    pub fn not_supported(feature: impl Into<String>, platform: impl Into<String>) -> Self {
        ProcmonError::NotSupported {
            feature: feature.into(),
            platform: platform.into(),
        }
    }

    /// Create a `System` error.
    pub fn system(message: impl Into<String>, errno: i32) -> Self {
        ProcmonError::System {
            message: message.into(),
            errno,
        }
    }

    /// Create a `System` error from the calling thread's last OS error.
    pub fn last_os_error(message: impl Into<String>) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        ProcmonError::system(message, errno)
    }

    /// Create a `Fatal` error.
    pub fn fatal(message: impl Into<String>) -> Self {
        ProcmonError::Fatal {
            message: message.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        ProcmonError::Internal {
            message: message.into(),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<io::Error> for ProcmonError {
    fn from(source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(errno) => ProcmonError::System {
                message: source.to_string(),
                errno,
            },
            None => ProcmonError::Internal {
                message: format!("IO error: {}", source),
            },
        }
    }
}

/// Result type alias for procmon operations.
pub type ProcmonResult<T> = Result<T, ProcmonError>;

// ============================================================================
// Tests
// ============================================================================
