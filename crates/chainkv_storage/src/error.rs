//! Storage errors.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Read outside of the written region.
    #[error("read beyond end of log: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Current size of the backend.
        size: u64,
    },

    /// Truncation would grow the log.
    #[error("cannot truncate log of {size} bytes to {requested} bytes")]
    InvalidTruncate {
        /// Current size of the backend.
        size: u64,
        /// Requested new size.
        requested: u64,
    },

    /// A fault injected through [`crate::FaultSwitch`].
    #[error("injected fault during {operation}")]
    Injected {
        /// Operation that was failed.
        operation: &'static str,
    },
}
