//! Change-detection guard
//!
//! Breaks feedback loops between observing a change and causing one: an
//! identical `(document id, revision)` pair seen again inside the debounce
//! window is dropped, and payloads handed to listeners are frozen snapshots
//! they cannot mutate.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Immutable, cheaply clonable snapshot of a value
///
/// Only shared access is possible; every clone points at the same snapshot.
#[derive(Debug, PartialEq)]
pub struct Frozen<T>(Arc<T>);

impl<T> Clone for Frozen<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Deref for Frozen<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: serde::Serialize> serde::Serialize for Frozen<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Deep-copy a value into a frozen snapshot
pub fn freeze_data<T: Clone>(data: &T) -> Frozen<T> {
    Frozen(Arc::new(data.clone()))
}

/// Deduplicates change notifications within a debounce window
#[derive(Debug)]
pub struct ChangeDetectionGuard {
    debounce: Duration,
    seen: HashMap<(String, String), Instant>,
}

impl ChangeDetectionGuard {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            seen: HashMap::new(),
        }
    }

    /// Decide whether a change should be processed, recording it as seen
    pub fn should_update(&mut self, document_id: &str, rev: &str) -> bool {
        let now = Instant::now();
        let debounce = self.debounce;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < debounce);

        let key = (document_id.to_string(), rev.to_string());
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    /// Forget everything seen so far
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Number of changes currently remembered
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_suppressed() {
        let mut guard = ChangeDetectionGuard::new(Duration::from_millis(100));
        assert!(guard.should_update("task-42", "1-abc"));
        assert!(!guard.should_update("task-42", "1-abc"));
        assert!(guard.should_update("task-42", "2-def"));
        assert!(guard.should_update("task-43", "1-abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry() {
        let mut guard = ChangeDetectionGuard::new(Duration::from_millis(100));
        assert!(guard.should_update("task-42", "1-abc"));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!guard.should_update("task-42", "1-abc"));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(guard.should_update("task-42", "1-abc"));
        assert_eq!(guard.tracked(), 1);
    }

    #[test]
    fn test_clear() {
        let mut guard = ChangeDetectionGuard::new(Duration::from_secs(60));
        guard.should_update("a", "1-x");
        guard.clear();
        assert!(guard.should_update("a", "1-x"));
    }

    #[test]
    fn test_frozen_is_detached_copy() {
        let mut original = vec!["title".to_string()];
        let frozen = freeze_data(&original);
        original.push("status".to_string());

        assert_eq!(frozen.len(), 1);
        let shared = frozen.clone();
        assert_eq!(*shared, vec!["title".to_string()]);
    }
}
