//! Sync and watch command handlers

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use tasksync_core::{
    Document, LocalStore, MemoryRemote, SyncEngine, SyncError, SyncEvent, SyncMode, SyncStatus,
};

use crate::output::{Output, OutputFormat};

/// Tasks the in-process remote starts with
const DEMO_TASKS: &[(&str, &str, &str, i64)] = &[
    ("task-welcome", "Try tasksync watch", "todo", 1),
    ("task-conflicts", "Edit a task on two devices", "todo", 2),
    ("project-demo", "Demo project", "active", 3),
];

/// Seed the in-process remote with tasks this store hasn't seen yet
pub fn seed_demo_remote(remote: &MemoryRemote, store: &LocalStore) -> Result<()> {
    for (id, title, status, priority) in DEMO_TASKS {
        if store.current(id)?.is_some() {
            continue;
        }
        let mut doc = Document::new(*id)
            .with_field("title", *title)
            .with_field("status", *status)
            .with_field("priority", *priority);
        doc.touch(Utc::now());
        remote.put(&doc)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct RunSummary {
    conflicts: usize,
    pulled: usize,
    pushed: usize,
}

impl RunSummary {
    fn record(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::ConflictResolved { .. } => self.conflicts += 1,
            SyncEvent::ChangeNotification(change) => match change.source {
                tasksync_core::ChangeSource::Push => self.pushed += 1,
                tasksync_core::ChangeSource::Pull => self.pulled += 1,
                tasksync_core::ChangeSource::CrossTab => {}
            },
            _ => {}
        }
    }
}

/// Run progressive sync once: init, enable, wait for the first live cycle, report
pub async fn sync(engine: &SyncEngine, output: &Output) -> Result<()> {
    engine.init().await?;
    let mut events = engine.subscribe();

    output.message("Enabling progressive sync...");
    let mode = match engine.enable_progressive_sync().await {
        Ok(mode) => mode,
        Err(SyncError::NoRemote) => bail!(
            "Remote not configured. Set it with:\n  \
             tasksync config set remote.url http://localhost:5984/tasks\n\
             or try the in-process remote with --memory-remote"
        ),
        Err(e) => return Err(e.into()),
    };

    let timeout = engine.config().remote.timeout();
    let summary = collect_run(&mut events, mode, timeout).await;

    let view = engine.view();
    let status = view.progressive_status();
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "sync": status,
                    "pulled": summary.pulled,
                    "pushed": summary.pushed,
                    "conflicts": summary.conflicts,
                    "errors": view.error_log()
                })
            );
        }
        _ => {
            output.print_status(&status);
            output.message("");
            output.message(&format!(
                "Pulled {} task change(s), pushed {}, resolved {} conflict(s)",
                summary.pulled, summary.pushed, summary.conflicts
            ));
            output.print_errors(&view.error_log());
        }
    }

    engine.destroy().await;

    if mode == SyncMode::Disabled {
        bail!(
            "Sync could not be enabled: {}",
            status.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

/// Gather buffered events and, once write-enabled, wait for the first live cycle
async fn collect_run(
    events: &mut broadcast::Receiver<SyncEvent>,
    mode: SyncMode,
    timeout: Duration,
) -> RunSummary {
    let mut summary = RunSummary::default();

    if mode != SyncMode::WriteEnabled {
        loop {
            match events.try_recv() {
                Ok(event) => summary.record(&event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        return summary;
    }

    let mut promoted = false;
    let waited = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ModeChanged(SyncMode::WriteEnabled)) => promoted = true,
                Ok(SyncEvent::StatusChanged(SyncStatus::Complete | SyncStatus::Error))
                    if promoted =>
                {
                    break;
                }
                Ok(event) => summary.record(&event),
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "Event receiver lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        debug!("Timed out waiting for the first live cycle");
    }
    summary
}

/// Enable sync and stream change notifications until Ctrl-C
pub async fn watch(engine: &SyncEngine, output: &Output) -> Result<()> {
    engine.init().await?;
    let mut events = engine.subscribe();

    if engine.config().remote.url.is_some() {
        let background = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = background.enable_progressive_sync().await {
                debug!("Progressive sync not started: {}", e);
            }
        });
    } else {
        output.message("No remote configured; watching local changes only.");
    }
    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::ChangeNotification(change)) => output.print_change(&change),
                Ok(SyncEvent::ModeChanged(mode)) => {
                    output.message(&format!("Sync mode: {}", mode));
                }
                Ok(SyncEvent::ConflictResolved { document_id, winner, confidence, .. }) => {
                    output.message(&format!(
                        "Conflict on {} resolved: {} wins ({:.2})",
                        document_id, winner, confidence
                    ));
                }
                Ok(SyncEvent::Error(e)) => {
                    if !output.is_quiet() {
                        eprintln!("⚠ {} ({}): {}", e.context, e.category, e.message);
                    }
                }
                Ok(SyncEvent::StatusChanged(status)) => debug!(%status, "Status changed"),
                Err(RecvError::Lagged(n)) => {
                    output.message(&format!("(skipped {} events)", n));
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.destroy().await;
    output.success("Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_skips_known_documents() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .put(&Document::new("task-welcome").with_field("title", "mine"))
            .unwrap();

        let remote = MemoryRemote::new();
        seed_demo_remote(&remote, &store).unwrap();

        assert!(remote.get("task-welcome").is_none());
        assert!(remote.get("task-conflicts").is_some());
        assert_eq!(remote.doc_count(), 2);
    }

    #[tokio::test]
    async fn test_collect_run_drains_when_not_promoted() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(SyncEvent::ConflictResolved {
            context: "pull".to_string(),
            document_id: "task-1".to_string(),
            winner: tasksync_core::Winner::Remote,
            confidence: 0.9,
        })
        .unwrap();
        tx.send(SyncEvent::ModeChanged(SyncMode::ReadOnly)).unwrap();

        let summary = collect_run(&mut rx, SyncMode::ReadOnly, Duration::from_secs(1)).await;
        assert_eq!(summary.conflicts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_run_waits_for_live_cycle() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(SyncEvent::StatusChanged(SyncStatus::Complete)).unwrap();
        tx.send(SyncEvent::ModeChanged(SyncMode::WriteEnabled)).unwrap();
        tx.send(SyncEvent::StatusChanged(SyncStatus::Syncing)).unwrap();
        tx.send(SyncEvent::StatusChanged(SyncStatus::Complete)).unwrap();

        let summary = collect_run(&mut rx, SyncMode::WriteEnabled, Duration::from_secs(5)).await;
        assert_eq!(summary.conflicts, 0);
        assert!(rx.try_recv().is_err());
    }
}
