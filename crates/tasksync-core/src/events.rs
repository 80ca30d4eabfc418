//! Process-local sync events
//!
//! A typed publish/subscribe bus that collaborators (UI, task store, CLI)
//! listen on. The engine is the only publisher; subscribers only read.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::document::Document;
use crate::error::{ErrorCategory, SyncError};
use crate::guard::Frozen;
use crate::resolver::Winner;

/// Default broadcast buffer; slower subscribers lose the oldest events
const EVENT_CAPACITY: usize = 256;

/// Replication status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing running
    Idle,
    /// Replication in progress
    Syncing,
    /// Live replication suspended while offline
    Paused,
    /// Last replication finished cleanly
    Complete,
    /// Last replication failed
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Paused => write!(f, "paused"),
            SyncStatus::Complete => write!(f, "complete"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Progressive enablement stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// No replication
    Disabled,
    /// Pull only; local writes stay local
    ReadOnly,
    /// Live bidirectional replication
    WriteEnabled,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Disabled => write!(f, "disabled"),
            SyncMode::ReadOnly => write!(f, "read-only"),
            SyncMode::WriteEnabled => write!(f, "write-enabled"),
        }
    }
}

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Where a change was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeSource {
    /// Written locally, by this or another process sharing the store
    CrossTab,
    /// Sent to the remote
    Push,
    /// Received from the remote
    Pull,
}

/// A classified document change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    pub document_id: String,
    pub change_type: ChangeType,
    pub is_task_related: bool,
    pub document: Document,
    pub source: ChangeSource,
    pub timestamp: DateTime<Utc>,
}

/// A caught replication error, as reported to listeners and the error log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEvent {
    pub context: String,
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl SyncErrorEvent {
    pub fn new(context: impl Into<String>, error: &SyncError) -> Self {
        Self {
            context: context.into(),
            category: error.category(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
            timestamp: Utc::now(),
        }
    }
}

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A task-related document changed
    ChangeNotification(Frozen<ChangeNotification>),
    /// Replication status changed
    StatusChanged(SyncStatus),
    /// Progressive mode changed
    ModeChanged(SyncMode),
    /// A replication conflict was resolved
    ConflictResolved {
        context: String,
        document_id: String,
        winner: Winner,
        confidence: f64,
    },
    /// A replication error was caught
    Error(SyncErrorEvent),
}

/// Broadcast bus plus a watchable status
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            tx,
            status: Arc::new(status),
        }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Update the status, publishing `StatusChanged` only on an actual change
    pub fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    /// Publish a caught error and set the status to `Error`
    pub fn report_error(&self, context: &str, error: &SyncError) -> SyncErrorEvent {
        let event = SyncErrorEvent::new(context, error);
        self.set_status(SyncStatus::Error);
        self.emit(SyncEvent::Error(event.clone()));
        event
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
