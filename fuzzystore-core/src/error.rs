//! Core error types.

use fuzzystore_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Coarse classification used by the dispatcher to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An internal opcode arrived from an external transport.
    ForbiddenInternalCommand,
    /// The storage collaborator failed.
    BackendUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ForbiddenInternalCommand => write!(f, "FORBIDDEN_INTERNAL_COMMAND"),
            ErrorKind::BackendUnavailable => write!(f, "BACKEND_UNAVAILABLE"),
        }
    }
}

/// Errors from the matching engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("internal command {0} is not accepted from external peers")]
    ForbiddenInternalCommand(&'static str),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] StorageError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ForbiddenInternalCommand(_) => ErrorKind::ForbiddenInternalCommand,
            CoreError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
        }
    }

    /// Returns whether a later retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnavailable
    }
}
