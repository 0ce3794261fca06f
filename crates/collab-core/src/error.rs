//! Error types for the collaboration engine

use thiserror::Error;

/// Main error type for collaboration engine operations
#[derive(Error, Debug)]
pub enum CollabError {
    /// Document was not found in storage or is not open
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Operation or intent references a field that does not exist
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Operation references an invalid position or mismatched field type
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    /// Operation attempted against a closed or archived document
    #[error("Invalid document state: {0}")]
    InvalidState(String),

    /// Local offline queue is at capacity; risks silent data loss if ignored
    #[error("Sync queue quota exceeded: {queued} queued, capacity {capacity}")]
    QuotaExceeded {
        /// Number of operations currently queued
        queued: usize,
        /// Configured queue capacity
        capacity: usize,
    },

    /// Transport send/receive failed; retried with backoff by the sync manager
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence boundary failed after bounded retries
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Session is no longer usable; the application must re-open the document
    #[error("Session failed: {0}")]
    SessionFailed(String),
}

/// Result type alias using CollabError
pub type CollabResult<T> = Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::DocumentNotFound("doc_abc".to_string());
        assert_eq!(format!("{}", err), "Document not found: doc_abc");
    }

    #[test]
    fn test_quota_exceeded_display() {
        let err = CollabError::QuotaExceeded {
            queued: 100,
            capacity: 100,
        };
        assert_eq!(
            format!("{}", err),
            "Sync queue quota exceeded: 100 queued, capacity 100"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CollabError = io_err.into();
        assert!(matches!(err, CollabError::Io(_)));
    }
}
