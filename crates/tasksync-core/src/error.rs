//! Sync engine error handling
//!
//! Typed errors for the local store and the replication path, with a
//! classification into the four failure categories the engine reacts to:
//!
//! - connectivity: remote unreachable or rejecting our credentials
//! - conflict: overlapping revisions (not a real failure, always resolved)
//! - protocol: malformed responses, timeouts
//! - contract: a collaborator called the engine incorrectly

use std::time::Duration;
use thiserror::Error;

use crate::storage::StoreError;

/// Broad failure category, used for status reporting and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Connectivity,
    Conflict,
    Protocol,
    Contract,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Conflict => write!(f, "conflict"),
            Self::Protocol => write!(f, "protocol"),
            Self::Contract => write!(f, "contract"),
        }
    }
}

/// Errors that can occur while syncing
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote could not be reached
    #[error("Remote unreachable ({url}): {details}")]
    Connectivity { url: String, details: String },

    /// Remote rejected our credentials
    #[error("Authentication failed for {url} (HTTP {status})")]
    Auth { url: String, status: u16 },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Remote answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Circuit breaker rejected the attempt before any I/O
    #[error("Circuit breaker open, sync attempt rejected")]
    CircuitOpen,

    /// Protected operation used before `init()`
    #[error("Sync engine not initialized; call init() first")]
    NotInitialized,

    /// Sync requested without a remote to sync with
    #[error("No remote configured; set remote.url")]
    NoRemote,

    /// Operation attempted on a destroyed engine
    #[error("Sync engine has been destroyed; construct a new one")]
    Destroyed,
}

impl SyncError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Connectivity { .. } | SyncError::Auth { .. } | SyncError::CircuitOpen => {
                ErrorCategory::Connectivity
            }
            SyncError::Http(e) if e.is_connect() => ErrorCategory::Connectivity,
            SyncError::Store(StoreError::Conflict { .. }) => ErrorCategory::Conflict,
            SyncError::NotInitialized | SyncError::NoRemote | SyncError::Destroyed => {
                ErrorCategory::Contract
            }
            SyncError::Timeout { .. }
            | SyncError::Protocol(_)
            | SyncError::Http(_)
            | SyncError::Store(_) => ErrorCategory::Protocol,
        }
    }

    /// Check if this is an authentication failure
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth { .. })
    }

    /// Check if a later retry may succeed without user action
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::Auth { .. }
                | SyncError::NotInitialized
                | SyncError::NoRemote
                | SyncError::Destroyed
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Connectivity { .. } => {
                Some("Check the remote URL and your network connection. Local data stays usable.")
            }
            SyncError::Auth { .. } => {
                Some("Check remote.username and remote.password in the configuration.")
            }
            SyncError::Timeout { .. } => {
                Some("The remote is slow to respond; consider raising remote.timeout_ms.")
            }
            SyncError::CircuitOpen => Some("Too many recent failures; sync resumes after a cooldown."),
            SyncError::NotInitialized => Some("Call init() on the engine before enabling sync."),
            SyncError::NoRemote => Some("Set remote.url (or TASKSYNC_REMOTE_URL) to a CouchDB database."),
            SyncError::Destroyed => Some("Create a new engine instance (e.g. after logout)."),
            _ => None,
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
