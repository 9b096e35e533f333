//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid cache path: {0}")]
    InvalidPath(String),

    #[error("Destination full: {0}")]
    DestinationFull(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Type record error: {0}")]
    TypeRecord(String),
}
