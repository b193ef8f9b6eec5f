//! Unified error types for the Vigil workspace.
//!
//! Lifecycle operations return a small fixed set of caller-visible failures;
//! callers are expected to branch on them. Degraded-but-continue conditions
//! (an unrecognized policy string, a module that fails to insert) are logged
//! and substituted with a safe default instead of surfacing here.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum VigilError {
    /// A caller-supplied parameter is invalid.
    #[error("bad parameter: {message}")]
    BadParameter {
        /// Description of the invalid parameter.
        message: String,
    },

    /// An internal operation failed.
    #[error("operation failed: {message}")]
    Fault {
        /// Description of the failed operation.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A configured list exceeded its fixed capacity.
    #[error("{what} exceeded the limit of {limit}")]
    Overflow {
        /// What overflowed.
        what: &'static str,
        /// The capacity that was exceeded.
        limit: usize,
    },

    /// The target of a start operation is already running.
    #[error("{kind} '{name}' is already running")]
    AlreadyRunning {
        /// Type of the running entity.
        kind: &'static str,
        /// Name of the running entity.
        name: String,
    },

    /// The target is busy with a conflicting operation.
    #[error("{kind} '{name}' is busy")]
    Busy {
        /// Type of the busy entity.
        kind: &'static str,
        /// Name of the busy entity.
        name: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A system call failed.
    #[error("{call}: {source}")]
    Sys {
        /// Name of the failing call.
        call: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },
}

impl VigilError {
    /// Builds a [`VigilError::Fault`] from anything printable.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
        }
    }

    /// Builds a [`VigilError::Sys`] from a call name and an OS error.
    pub fn sys(call: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Sys {
            call,
            source: source.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VigilError>;
