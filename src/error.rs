// src/error.rs

//! Crate-wide error type
//!
//! Every failure maps onto one of a handful of kinds (see [`ErrorKind`]).
//! The kind decides whether an operation is retried and what message ends up
//! on a failed request.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Message recorded on a request when the failure is not actionable by the requester
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred";

/// Coarse classification of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported input; never retried
    Validation,
    /// Store or source control unreachable; retried with backoff
    Network,
    /// A tool exited non-zero or timed out
    Subprocess,
    /// Valid input that is intentionally rejected
    UnsupportedFeature,
    /// Checksum mismatch; never retried
    Integrity,
    /// Anything else (I/O, database, serialization)
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    UnsupportedFeature(String),

    #[error("{0}")]
    NetworkError(String),

    #[error("{0}")]
    DownloadError(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("{0}")]
    CommandTimeout(String),

    #[error("Checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Duplicate package: {0}")]
    DuplicatePackage(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ValidationError(_)
            | Error::ParseError(_)
            | Error::DuplicatePackage(_)
            | Error::InvalidTransition(_)
            | Error::ConfigError(_) => ErrorKind::Validation,
            Error::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            Error::NetworkError(_) | Error::DownloadError(_) => ErrorKind::Network,
            Error::CommandFailed(_) | Error::CommandTimeout(_) => ErrorKind::Subprocess,
            Error::ChecksumMismatch { .. } => ErrorKind::Integrity,
            Error::NotFoundError(_)
            | Error::AlreadyExists(_)
            | Error::IoError(_)
            | Error::Io(_)
            | Error::DatabaseError(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NetworkError(_) | Error::DownloadError(_) | Error::CommandTimeout(_)
        )
    }

    /// The message recorded on a failed request
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => UNKNOWN_ERROR_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::ValidationError("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::CommandTimeout("x".into()).kind(),
            ErrorKind::Subprocess
        );
        assert_eq!(
            Error::ChecksumMismatch {
                name: "a".into(),
                expected: "1".into(),
                actual: "2".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_transient() {
        assert!(Error::NetworkError("down".into()).is_transient());
        assert!(Error::CommandTimeout("go".into()).is_transient());
        assert!(!Error::CommandFailed("go".into()).is_transient());
        assert!(
            !Error::ChecksumMismatch {
                name: "a".into(),
                expected: "1".into(),
                actual: "2".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_user_message() {
        let err = Error::ValidationError("The lockfile is missing".into());
        assert_eq!(err.user_message(), "The lockfile is missing");

        let err = Error::IoError("disk full".into());
        assert_eq!(err.user_message(), UNKNOWN_ERROR_MESSAGE);
    }
}
