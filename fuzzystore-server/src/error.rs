//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
///
/// None of these are produced for a single bad request; requests are
/// answered or dropped by the handler. These cover startup, listeners and
/// stream connections.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] fuzzystore_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] fuzzystore_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] fuzzystore_storage::StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("update sealed by unknown master key {0}")]
    UnknownMasterKey(String),

    #[error("malformed update batch: {0}")]
    BadUpdate(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::Storage(_) => true,
            ServerError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}
