//! Core error types

use filecache_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache type not found: {0}")]
    TypeNotFound(String),

    #[error("Cache object not found: {0}")]
    ObjectNotFound(String),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Destination full: {0}")]
    DestinationFull(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl CoreError {
    /// Map a copy-out failure for `path_name`
    pub(crate) fn from_copy(e: StorageError, path_name: &str) -> Self {
        match e {
            StorageError::NotFound(_) => CoreError::ObjectNotFound(path_name.to_string()),
            StorageError::DestinationFull(msg) => CoreError::DestinationFull(msg),
            StorageError::InvalidDestination(msg) => CoreError::InvalidDestination(msg),
            other => CoreError::Storage(other),
        }
    }
}
