//! Error types for local store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted snapshot could not be decoded.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// The store is closed.
    #[error("store is closed")]
    Closed,
}
