//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the store.
    #[error("read beyond end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current store size.
        size: u64,
    },

    /// A blob frame failed validation.
    #[error("corrupted blob frame at offset {offset}: {message}")]
    CorruptedFrame {
        /// Offset of the frame header.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// A blob id string could not be parsed.
    #[error("invalid blob id: {0}")]
    InvalidBlobId(String),
}

impl StorageError {
    /// Creates a corrupted frame error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptedFrame {
            offset,
            message: message.into(),
        }
    }
}
