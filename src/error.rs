//! WolfSync Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects the sync unit it occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retried per the retry policy, surfaced only when retries run out
    Transient,
    /// Fails the collection (or database) it occurred in, siblings continue
    SchemaConflict,
    /// Aborts the entire run
    Fatal,
    /// Deliberate cancellation, not an error
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "TRANSIENT"),
            ErrorClass::SchemaConflict => write!(f, "SCHEMA_CONFLICT"),
            ErrorClass::Fatal => write!(f, "FATAL"),
            ErrorClass::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Leader unavailable: {0}")]
    LeaderUnavailable(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Incompatible leader: expected protocol {expected}, leader speaks {actual}")]
    IncompatibleLeader { expected: u32, actual: u32 },

    #[error("Authentication rejected by leader: {0}")]
    AuthenticationRejected(String),

    #[error("Leader error: {0}")]
    Remote(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Schema errors
    #[error("Schema conflict on {collection}: {reason}")]
    SchemaConflict { collection: String, reason: String },

    #[error("Failed to create index {index} on {collection}: {reason}")]
    IndexCreation {
        collection: String,
        index: String,
        reason: String,
    },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Local storage corrupted: {0}")]
    StorageCorrupted(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Run errors
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Sync run failed: {cause} ({} collections incomplete)", .incomplete.len())]
    RunFailed {
        cause: Box<Error>,
        incomplete: Vec<String>,
    },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Classify this error for retry and propagation decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::Timeout(_)
            | Error::LeaderUnavailable(_)
            | Error::Io(_) => ErrorClass::Transient,

            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::Protocol(_)
            | Error::Serialization(_)
            | Error::IncompatibleLeader { .. }
            | Error::AuthenticationRejected(_)
            | Error::StorageCorrupted(_)
            | Error::State(_)
            | Error::RunFailed { .. } => ErrorClass::Fatal,

            Error::Remote(_)
            | Error::NotFound(_)
            | Error::SchemaConflict { .. }
            | Error::IndexCreation { .. }
            | Error::Storage(_)
            | Error::Json(_)
            | Error::RetriesExhausted { .. }
            | Error::Internal(_) => ErrorClass::SchemaConflict,

            Error::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Timeout("chunk".into()).is_retryable());
        assert!(Error::ConnectionFailed {
            address: "leader:7654".into(),
            reason: "refused".into(),
        }
        .is_retryable());
        assert!(Error::IncompatibleLeader { expected: 1, actual: 2 }.is_fatal());
        assert!(Error::AuthenticationRejected("bad token".into()).is_fatal());
        assert!(Error::StorageCorrupted("page checksum".into()).is_fatal());
        assert_eq!(
            Error::SchemaConflict {
                collection: "users".into(),
                reason: "type changed".into(),
            }
            .class(),
            ErrorClass::SchemaConflict
        );
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_exhausted_retries_are_not_retried_again() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            last: Box::new(Error::Network("reset".into())),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("5 attempts"));
    }
}
