//! Cross-tab change propagation
//!
//! Follows the local store's change feed and republishes task-related changes
//! as [`ChangeNotification`] events. Because the feed also polls the database
//! file, writes made by other processes sharing the store show up here too.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PropagationConfig;
use crate::document::Document;
use crate::error::SyncError;
use crate::events::{
    ChangeNotification, ChangeSource, ChangeType, EventBus, SyncEvent, SyncStatus,
};
use crate::guard::{freeze_data, ChangeDetectionGuard};
use crate::storage::{ChangeFeed, ChangeOrigin, FeedEvent, LocalStore, StoreResult};

/// Id prefixes that mark task-domain documents
const TASK_ID_PREFIXES: &[&str] = &["task-", "task:", "project-", "project:"];

/// Body fields that mark a task-shaped document
const TASK_FIELDS: &[&str] = &["title", "status", "priority", "subtasks", "projectId"];

/// Internal documents (indexes, design docs, local checkpoints)
pub fn is_internal(id: &str) -> bool {
    id.starts_with('_')
}

/// Whether a document belongs to the task domain, by id prefix or shape
pub fn is_task_related(doc: &Document) -> bool {
    TASK_ID_PREFIXES.iter().any(|p| doc.id.starts_with(p))
        || TASK_FIELDS.iter().any(|f| doc.body.contains_key(*f))
}

/// Classify a change from its tombstone flag and revision ancestry depth
pub fn classify_change(doc: &Document, depth: usize) -> ChangeType {
    if doc.deleted {
        ChangeType::Delete
    } else if depth > 1 {
        ChangeType::Update
    } else {
        ChangeType::Create
    }
}

/// Running propagator; stops when dropped
pub struct ChangePropagator {
    task: JoinHandle<()>,
    pending: Arc<AtomicUsize>,
}

impl ChangePropagator {
    /// Subscribe to changes made from now on and start republishing them
    pub fn start(store: LocalStore, bus: EventBus, config: &PropagationConfig) -> StoreResult<Self> {
        let feed = ChangeFeed::from_now(store, config.feed_poll_interval())?;
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            bus,
            guard: ChangeDetectionGuard::new(config.debounce()),
            pending: Arc::clone(&pending),
            settle_delay: config.settle_delay(),
            feed_failed: false,
        };
        let task = tokio::spawn(worker.run(feed));

        Ok(Self { task, pending })
    }

    /// Approximate number of recently emitted changes still settling
    pub fn pending_changes(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Whether the propagation task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop following the feed
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ChangePropagator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    bus: EventBus,
    guard: ChangeDetectionGuard,
    pending: Arc<AtomicUsize>,
    settle_delay: Duration,
    feed_failed: bool,
}

impl Worker {
    async fn run(mut self, mut feed: ChangeFeed) {
        debug!("Change propagator started");
        while let Some(item) = feed.next().await {
            match item {
                Ok(event) => {
                    if self.feed_failed {
                        self.feed_failed = false;
                        if self.bus.status() == SyncStatus::Error {
                            self.bus.set_status(SyncStatus::Idle);
                        }
                    }
                    self.handle(event);
                }
                Err(e) => {
                    warn!("Change feed error: {}", e);
                    self.feed_failed = true;
                    self.bus.report_error("change-feed", &SyncError::Store(e));
                }
            }
        }
        debug!("Change propagator stopped");
    }

    fn handle(&mut self, event: FeedEvent) {
        let FeedEvent {
            change,
            depth,
            previous,
        } = event;
        let doc = change.doc;

        if is_internal(&doc.id) {
            return;
        }
        let rev = doc.rev.clone().unwrap_or_default();
        if !self.guard.should_update(&doc.id, &rev) {
            debug!(id = %doc.id, rev = %rev, "Duplicate change suppressed");
            return;
        }
        // Tombstones carry no body; judge them by what was deleted
        let task_related =
            is_task_related(&doc) || previous.as_ref().is_some_and(is_task_related);
        if !task_related {
            return;
        }

        let notification = ChangeNotification {
            document_id: doc.id.clone(),
            change_type: classify_change(&doc, depth),
            is_task_related: task_related,
            source: match change.origin {
                ChangeOrigin::Local => ChangeSource::CrossTab,
                ChangeOrigin::Pull => ChangeSource::Pull,
            },
            document: doc,
            timestamp: Utc::now(),
        };
        debug!(
            id = %notification.document_id,
            change_type = ?notification.change_type,
            "Propagating change"
        );

        self.pending.fetch_add(1, Ordering::Relaxed);
        self.bus
            .emit(SyncEvent::ChangeNotification(freeze_data(&notification)));

        let pending = Arc::clone(&self.pending);
        let settle_delay = self.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(settle_delay).await;
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> PropagationConfig {
        PropagationConfig {
            debounce_ms: 100,
            settle_delay_ms: 200,
            feed_poll_interval_ms: 20,
        }
    }

    async fn next_notification(
        rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>,
    ) -> ChangeNotification {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for notification")
                .unwrap();
            if let SyncEvent::ChangeNotification(n) = event {
                return (*n).clone();
            }
        }
    }

    #[test]
    fn test_task_related_heuristics() {
        assert!(is_task_related(&Document::new("task-42")));
        assert!(is_task_related(&Document::new("project:inbox")));
        assert!(is_task_related(
            &Document::new("abc").with_field("subtasks", json!([]))
        ));
        assert!(!is_task_related(
            &Document::new("settings").with_field("theme", "dark")
        ));
        assert!(is_internal("_design/tasks"));
        assert!(!is_internal("task-1"));
    }

    #[test]
    fn test_classify_change() {
        let doc = Document::new("task-1");
        assert_eq!(classify_change(&doc, 1), ChangeType::Create);
        assert_eq!(classify_change(&doc, 3), ChangeType::Update);
        let tomb = Document::tombstone("task-1", Some("2-a".to_string()));
        assert_eq!(classify_change(&tomb, 2), ChangeType::Delete);
    }

    #[tokio::test]
    async fn test_propagates_create_update_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let _propagator = ChangePropagator::start(store.clone(), bus.clone(), &config()).unwrap();

        let created = store
            .put(&Document::new("task-42").with_field("status", "todo"))
            .unwrap();
        let n = next_notification(&mut rx).await;
        assert_eq!(n.document_id, "task-42");
        assert_eq!(n.change_type, ChangeType::Create);
        assert!(n.is_task_related);
        assert_eq!(n.source, ChangeSource::CrossTab);

        let updated = store.put(&created.with_field("status", "done")).unwrap();
        let n = next_notification(&mut rx).await;
        assert_eq!(n.change_type, ChangeType::Update);
        assert_eq!(n.document.get("status"), Some(&json!("done")));

        store
            .delete("task-42", updated.rev.as_deref().unwrap())
            .unwrap();
        let n = next_notification(&mut rx).await;
        assert_eq!(n.change_type, ChangeType::Delete);
    }

    #[tokio::test]
    async fn test_delete_of_task_shaped_document() {
        let store = LocalStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let _propagator = ChangePropagator::start(store.clone(), bus.clone(), &config()).unwrap();

        let stored = store
            .put(&Document::new("abc").with_field("title", "no prefix"))
            .unwrap();
        assert_eq!(next_notification(&mut rx).await.change_type, ChangeType::Create);

        store.delete("abc", stored.rev.as_deref().unwrap()).unwrap();
        let n = next_notification(&mut rx).await;
        assert_eq!(n.document_id, "abc");
        assert_eq!(n.change_type, ChangeType::Delete);
        assert!(n.is_task_related);

        // Deleting an unrelated document stays silent
        let settings = store
            .put(&Document::new("settings").with_field("theme", "dark"))
            .unwrap();
        store
            .delete("settings", settings.rev.as_deref().unwrap())
            .unwrap();
        store.put(&Document::new("task-2")).unwrap();
        assert_eq!(next_notification(&mut rx).await.document_id, "task-2");
    }

    #[tokio::test]
    async fn test_filters_internal_and_unrelated_documents() {
        let store = LocalStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let _propagator = ChangePropagator::start(store.clone(), bus.clone(), &config()).unwrap();

        store
            .put(&Document::new("_design/index").with_field("title", "x"))
            .unwrap();
        store
            .put(&Document::new("settings").with_field("theme", "dark"))
            .unwrap();
        store.put(&Document::new("task-1")).unwrap();

        let n = next_notification(&mut rx).await;
        assert_eq!(n.document_id, "task-1");
    }

    #[tokio::test]
    async fn test_pending_counter_settles() {
        let store = LocalStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let propagator = ChangePropagator::start(store.clone(), bus.clone(), &config()).unwrap();
        assert!(propagator.is_running());

        store.put(&Document::new("task-1")).unwrap();
        next_notification(&mut rx).await;
        assert_eq!(propagator.pending_changes(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(propagator.pending_changes(), 0);

        propagator.stop();
    }
}
