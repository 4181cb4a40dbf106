//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to truncate to a size larger than the current one.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncateBeyondEnd {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// Another process holds the advisory lock on this file.
    #[error("log file is locked by another process: {0}")]
    Locked(PathBuf),
}
