//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot {} has unknown format {format}", path.display())]
    UnknownFormat { path: PathBuf, format: u32 },

    #[error("snapshot {} checksum mismatch", .0.display())]
    ChecksumMismatch(PathBuf),

    #[error("invalid stored digest: {0}")]
    InvalidDigest(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("revision {revision} from {origin} is not newer than {current}")]
    StaleRevision {
        origin: String,
        revision: u64,
        current: u64,
    },
}

impl StorageError {
    /// Returns true if the on-disk data cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::UnknownFormat { .. }
                | StorageError::ChecksumMismatch(_)
                | StorageError::InvalidDigest(_)
        )
    }
}
