//! Error types for the session store

use std::path::PathBuf;
use thiserror::Error;

/// Result type for session store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while recording, persisting or rebuilding sessions
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("Invalid session ID format: {session_id}")]
    InvalidSessionId { session_id: String },

    #[error("Out of order event for session {session_id}: expected sequence {expected}, found {found}")]
    OutOfOrder {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Event belongs to session {found}, not {expected}")]
    SessionMismatch { expected: String, found: String },

    #[error("Corrupted session data: {message}")]
    CorruptedData { message: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },
}

impl StoreError {
    /// Create a config error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a corrupted data error
    pub fn corrupted<S: Into<String>>(message: S) -> Self {
        Self::CorruptedData {
            message: message.into(),
        }
    }

    /// Create a session not found error
    pub fn not_found<S: Into<String>>(session_id: S) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_message() {
        let err = StoreError::OutOfOrder {
            session_id: "s-1".into(),
            expected: 3,
            found: 5,
        };
        assert_eq!(
            err.to_string(),
            "Out of order event for session s-1: expected sequence 3, found 5"
        );
    }
}
