//! End-to-end scenarios against the in-process remote

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tasksync_core::{
    ActiveHandles, ChangeNotification, ChangeSource, ChangeType, Config, Document, LocalStore,
    MemoryRemote, SyncEngine, SyncError, SyncEvent, SyncMode,
};

fn config() -> Config {
    let mut config = Config::default();
    config.remote.url = Some("memory://tasks".to_string());
    config
}

fn engine(remote: &MemoryRemote) -> SyncEngine {
    SyncEngine::new(
        config(),
        LocalStore::open_in_memory().unwrap(),
        Some(Arc::new(remote.clone())),
    )
}

/// Wait for the next change notification matching `pred`
async fn next_change(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&ChangeNotification) -> bool,
) -> Option<ChangeNotification> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ChangeNotification(change)) if pred(&change) => {
                    return Some((*change).clone());
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .ok()
        .flatten()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_promotion_sequence() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine.init().await.unwrap();

    let view = engine.view();
    assert_eq!(view.mode(), SyncMode::Disabled);
    assert!(view.health_report().score >= 80);

    let mode = engine.enable_progressive_sync().await.unwrap();
    assert_eq!(mode, SyncMode::WriteEnabled);
    assert_eq!(
        view.active_handles(),
        ActiveHandles {
            bidirectional: 1,
            one_directional: 0
        }
    );
    assert!(view.is_progressive_sync_ready());
    assert!(view.progressive_status().promoted_at.is_some());

    engine.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_init_runs_once() {
    let remote = MemoryRemote::new();
    let mut config = config();
    config.sync_enabled = true;
    let engine = SyncEngine::new(
        config,
        LocalStore::open_in_memory().unwrap(),
        Some(Arc::new(remote.clone())),
    );

    let (a, b) = tokio::join!(engine.init(), engine.init());
    a.unwrap();
    b.unwrap();

    let view = engine.view();
    assert_eq!(view.mode(), SyncMode::WriteEnabled);
    assert_eq!(view.active_handles().bidirectional, 1);
    assert_eq!(view.active_handles().one_directional, 0);

    engine.init().await.unwrap();
    assert_eq!(view.active_handles().bidirectional, 1);

    engine.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_local_write_propagates_once() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine.init().await.unwrap();
    let mut events = engine.subscribe();

    let stored = engine
        .store()
        .put(&Document::new("task-42").with_field("status", "todo"))
        .unwrap();

    let change = next_change(&mut events, |c| c.document_id == "task-42")
        .await
        .expect("change notification");
    assert_eq!(change.change_type, ChangeType::Create);
    assert!(change.is_task_related);
    assert_eq!(change.source, ChangeSource::CrossTab);
    assert_eq!(change.document.rev, stored.rev);

    // A stale write is rejected and nothing else is announced
    let stale = engine
        .store()
        .put(&Document::new("task-42").with_field("status", "done"));
    assert!(stale.is_err());
    assert!(next_change(&mut events, |c| c.document_id == "task-42")
        .await
        .is_none());

    engine.destroy().await;
}

#[tokio::test]
async fn test_write_from_other_handle_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasksync.db");

    let mut config = config();
    config.propagation.feed_poll_interval_ms = 20;
    let engine = SyncEngine::new(config, LocalStore::open(&path).unwrap(), None);
    engine.init().await.unwrap();
    let mut events = engine.subscribe();

    // A second connection stands in for another process on the same file
    let other = LocalStore::open(&path).unwrap();
    other
        .put(&Document::new("task-7").with_field("title", "from elsewhere"))
        .unwrap();

    let change = next_change(&mut events, |c| c.document_id == "task-7")
        .await
        .expect("change from other handle");
    assert_eq!(change.change_type, ChangeType::Create);

    // Non-task documents are filtered out
    other
        .put(&Document::new("settings").with_field("theme", "dark"))
        .unwrap();
    other
        .put(&Document::new("task-8").with_field("title", "next"))
        .unwrap();
    let change = next_change(&mut events, |_| true).await.unwrap();
    assert_eq!(change.document_id, "task-8");

    engine.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_engines_replicate_through_remote() {
    let remote = MemoryRemote::new();
    let alice = engine(&remote);
    let bob = engine(&remote);
    for e in [&alice, &bob] {
        e.init().await.unwrap();
        assert_eq!(
            e.enable_progressive_sync().await.unwrap(),
            SyncMode::WriteEnabled
        );
    }
    let mut bob_events = bob.subscribe();

    alice
        .store()
        .put(&Document::new("task-1").with_field("title", "Buy milk"))
        .unwrap();

    let change = next_change(&mut bob_events, |c| {
        c.document_id == "task-1" && c.source == ChangeSource::Pull
    })
    .await
    .expect("pulled change on the second engine");
    assert_eq!(change.change_type, ChangeType::Create);

    let doc = bob.store().get("task-1").unwrap().unwrap();
    assert_eq!(doc.get("title").and_then(|v| v.as_str()), Some("Buy milk"));

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_pull_holds_read_only() {
    let remote = MemoryRemote::new();
    let alice = engine(&remote);
    let bob = engine(&remote);

    alice
        .store()
        .put(&Document::new("task-7").with_field("title", "alice's"))
        .unwrap();
    bob.store()
        .put(
            &Document::new("task-7")
                .with_field("title", "bob's")
                .with_field("status", "doing"),
        )
        .unwrap();

    alice.init().await.unwrap();
    alice.enable_progressive_sync().await.unwrap();
    wait_until(|| remote.get("task-7").is_some()).await;

    bob.init().await.unwrap();
    let mode = bob.enable_progressive_sync().await.unwrap();

    let view = bob.view();
    assert_eq!(mode, SyncMode::ReadOnly);
    assert!(!view.is_progressive_sync_ready());
    assert!(view.progressive_status().reason.is_some());
    assert_eq!(view.conflict_log(10).len(), 1);
    assert_eq!(view.conflict_log(10)[0].document_id, "task-7");
    assert_eq!(view.active_handles(), ActiveHandles::default());

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_terminal() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine.init().await.unwrap();
    engine.enable_progressive_sync().await.unwrap();

    engine.destroy().await;
    let view = engine.view();
    assert!(!view.can_sync());
    assert_eq!(view.mode(), SyncMode::Disabled);
    assert_eq!(view.active_handles(), ActiveHandles::default());
    assert!(view.is_destroyed());

    // init() after destroy() is a no-op, and nothing restarts
    engine.init().await.unwrap();
    assert_eq!(view.mode(), SyncMode::Disabled);
    assert!(matches!(
        engine.enable_progressive_sync().await,
        Err(SyncError::Destroyed)
    ));
    assert!(matches!(
        engine.set_online(true).await,
        Err(SyncError::Destroyed)
    ));

    // Local data stays usable
    engine
        .store()
        .put(&Document::new("task-9").with_field("title", "still here"))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_remote_keeps_local_usable() {
    let remote = MemoryRemote::new();
    remote.set_unreachable(true);
    let engine = engine(&remote);
    engine.init().await.unwrap();

    let mode = engine.enable_progressive_sync().await.unwrap();
    assert_eq!(mode, SyncMode::Disabled);
    assert!(!engine.view().error_log().is_empty());

    engine
        .store()
        .put(&Document::new("task-1").with_field("title", "offline"))
        .unwrap();
    assert_eq!(engine.store().doc_count().unwrap(), 1);

    // Once the remote is back, enabling again succeeds
    remote.set_unreachable(false);
    let mode = engine.enable_progressive_sync().await.unwrap();
    assert_eq!(mode, SyncMode::WriteEnabled);
    wait_until(|| remote.get("task-1").is_some()).await;

    engine.destroy().await;
}
