//! Storage error handling
//!
//! Typed errors for local store operations.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while preparing the database location
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document body could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Write carried a stale or missing revision
    #[error("Document update conflict for '{id}'")]
    Conflict { id: String },

    /// Document does not exist
    #[error("Document not found: '{id}'")]
    NotFound { id: String },

    /// Revision string is not of the form `<generation>-<hash>`
    #[error("Invalid revision: '{0}'")]
    InvalidRevision(String),

    /// Connection mutex was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Check if this error is a revision conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
