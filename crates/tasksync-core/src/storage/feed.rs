//! Live change feed
//!
//! Streams change-log entries from a starting sequence. Writes through the
//! same store handle (or its clones) wake the feed immediately; writes from
//! other processes sharing the database file are picked up on the next poll.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::StoreResult;
use super::local::{LocalStore, StoredChange};
use crate::document::Document;

/// Changes read per poll
const FEED_BATCH: usize = 100;

/// A change as delivered by the feed
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub change: StoredChange,
    /// Length of the revision's ancestry
    pub depth: usize,
    /// For tombstones, the last live version before the delete
    pub previous: Option<Document>,
}

/// Handle to a running change feed; the background task stops when dropped
pub struct ChangeFeed {
    rx: mpsc::Receiver<StoreResult<FeedEvent>>,
    task: JoinHandle<()>,
}

impl ChangeFeed {
    /// Follow changes made from now on (history is not replayed)
    pub fn from_now(store: LocalStore, poll_interval: Duration) -> StoreResult<Self> {
        let since = store.update_seq()?;
        Ok(Self::since(store, since, poll_interval))
    }

    /// Follow changes after the given sequence
    pub fn since(store: LocalStore, since: i64, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(FEED_BATCH);
        let task = tokio::spawn(run_feed(store, since, poll_interval, tx));
        Self { rx, task }
    }

    /// Wait for the next change (or feed error)
    ///
    /// Returns `None` once the feed task has stopped.
    pub async fn next(&mut self) -> Option<StoreResult<FeedEvent>> {
        self.rx.recv().await
    }

    /// Stop following changes
    pub fn close(&mut self) {
        self.task.abort();
        self.rx.close();
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed(
    store: LocalStore,
    mut last_seq: i64,
    poll_interval: Duration,
    tx: mpsc::Sender<StoreResult<FeedEvent>>,
) {
    let mut seq_rx = store.subscribe_seq();
    debug!(since = last_seq, "Change feed started");

    loop {
        let mut fetched = 0;
        match store.changes_since(last_seq, FEED_BATCH) {
            Ok(changes) => {
                fetched = changes.len();
                for change in changes {
                    last_seq = change.seq;
                    if tx.send(feed_event(&store, change)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                if tx.send(Err(e)).await.is_err() {
                    return;
                }
            }
        }

        if fetched == FEED_BATCH {
            continue;
        }

        tokio::select! {
            changed = seq_rx.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tx.closed() => {
                debug!("Change feed receiver dropped");
                return;
            }
        }
    }
}

fn feed_event(store: &LocalStore, change: StoredChange) -> StoreResult<FeedEvent> {
    let depth = store.revision_depth(change.id(), change.rev())?;
    let previous = if change.doc.deleted {
        store.last_live_before(change.id(), change.seq)?
    } else {
        None
    };
    Ok(FeedEvent {
        change,
        depth,
        previous,
    })
}
