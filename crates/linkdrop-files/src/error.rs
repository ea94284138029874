//! Storage error types.

use crate::store::FileId;
use thiserror::Error;

/// Chunked storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// No entry with this id
    #[error("file entry {0} not found")]
    NotFound(FileId),

    /// Entry was already committed; it accepts no further pages
    #[error("file entry {0} is already committed")]
    AlreadyCommitted(FileId),

    /// Page sequence number does not follow the last stored page
    #[error("file entry {id}: expected page {expected}, got {actual}")]
    OutOfOrder {
        /// Entry id
        id: FileId,
        /// Next expected sequence number
        expected: u64,
        /// Sequence number received
        actual: u64,
    },

    /// Invalid storage configuration
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure in an on-disk store
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded
    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Returns true if the entry does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        assert!(StorageError::NotFound(FileId(3)).is_not_found());
        assert!(!StorageError::AlreadyCommitted(FileId(3)).is_not_found());
        let io = StorageError::from(std::io::Error::other("disk full"));
        assert!(!io.is_not_found());
    }

    #[test]
    fn test_out_of_order_display() {
        let err = StorageError::OutOfOrder {
            id: FileId(7),
            expected: 2,
            actual: 4,
        };
        assert_eq!(err.to_string(), "file entry 7: expected page 2, got 4");
    }
}
