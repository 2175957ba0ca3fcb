//! Error types for strata.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using strata's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for strata operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Upload would push the owner's storage usage over quota
    #[error("Storage quota exceeded: {used} + {requested} bytes exceeds quota of {quota} bytes")]
    QuotaExceeded {
        owner_id: Uuid,
        used: i64,
        requested: i64,
        quota: i64,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Content store operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Event bus publish/subscribe failed
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later can plausibly succeed.
    ///
    /// Handlers use this to classify failures of their collaborators into
    /// retryable and permanent outcomes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Storage(_) | Error::Bus(_) | Error::Request(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_document_not_found() {
        let id = Uuid::nil();
        let err = Error::DocumentNotFound(id);
        assert_eq!(err.to_string(), format!("Document not found: {}", id));
    }

    #[test]
    fn test_error_display_quota_exceeded() {
        let err = Error::QuotaExceeded {
            owner_id: Uuid::nil(),
            used: 900,
            requested: 200,
            quota: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Storage quota exceeded: 900 + 200 bytes exceeds quota of 1000 bytes"
        );
    }

    #[test]
    fn test_error_display_storage() {
        let err = Error::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Storage("timeout".into()).is_transient());
        assert!(Error::Request("connection reset".into()).is_transient());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")).is_transient());
        assert!(!Error::InvalidInput("corrupt".into()).is_transient());
        assert!(!Error::DocumentNotFound(Uuid::nil()).is_transient());
        assert!(!Error::Config("missing key".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().contains("Serialization error:"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
