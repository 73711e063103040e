//! Error types for pipeline-state

use thiserror::Error;

/// Errors raised by blob stores and run logs.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Blob not present in the store
    #[error("blob not found: {digest}")]
    NotFound { digest: String },

    /// Digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Run record not present in the log
    #[error("run record not found: {record_id}")]
    RecordNotFound { record_id: String },

    /// Attempt to finalize a record twice
    #[error("run record {record_id} is already finalized")]
    AlreadyFinalized { record_id: String },

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failure
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_finalized_displays_record() {
        let err = StorageError::AlreadyFinalized {
            record_id: "rec-1".to_string(),
        };
        assert!(err.to_string().contains("rec-1"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
