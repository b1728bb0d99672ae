//! Storage error types.
//!
//! - `NotFound`: a row that must exist is missing
//! - `Serialization`: failed to encode/decode a row
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Row not found
    #[error("{table} row not found: {id}")]
    NotFound {
        /// Table that was searched
        table: &'static str,
        /// Row id that was missing
        id: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// I/O failures may clear up on retry; bad bytes will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
