//! Replication between the local store and the remote
//!
//! [`Replicator`] implements one pull (remote → local) and one push
//! (local → remote) pass. [`ReplicationHandle`] runs passes on a background
//! task: once for a one-directional pull, or continuously for live
//! bidirectional sync, woken by local writes or the poll interval.
//!
//! Loop prevention: pulled revisions are stored with origin `pull` and are
//! never pushed back; only revisions that are still current are pushed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::breaker::CircuitBreaker;
use crate::config::RemoteConfig;
use crate::document::{Document, RevisionHistory};
use crate::error::{SyncError, SyncResult};
use crate::events::{ChangeNotification, ChangeSource, EventBus, SyncEvent, SyncStatus};
use crate::guard::freeze_data;
use crate::propagator::{classify_change, is_internal, is_task_related};
use crate::remote::{RemoteDoc, RemoteStore, RevsMap, INITIAL_SEQ};
use crate::resolver::{ConflictResolver, ConflictStrategy, Winner};
use crate::storage::LocalStore;

/// Which way a handle replicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// One-shot remote → local
    Pull,
    /// Live bidirectional
    Sync,
}

impl Direction {
    pub fn context(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Sync => "sync",
        }
    }
}

/// Counters for one replication pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Remote revisions written locally
    pub pulled: usize,
    /// Local revisions sent to the remote
    pub pushed: usize,
    /// Conflicts adjudicated by the resolver
    pub conflicts: usize,
    /// Remote changes already known locally
    pub skipped: usize,
}

impl CycleStats {
    fn merge(&mut self, other: CycleStats) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
    }
}

/// Outcome of one cycle, reported to whoever spawned the handle
#[derive(Debug)]
pub struct CycleReport {
    pub direction: Direction,
    pub outcome: SyncResult<CycleStats>,
}

/// Replicates one local store with one remote
pub struct Replicator {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    breaker: Arc<CircuitBreaker>,
    resolver: Arc<Mutex<ConflictResolver>>,
    bus: EventBus,
    config: RemoteConfig,
    strategy: ConflictStrategy,
}

impl Replicator {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        breaker: Arc<CircuitBreaker>,
        resolver: Arc<Mutex<ConflictResolver>>,
        bus: EventBus,
        config: RemoteConfig,
    ) -> Self {
        let strategy = resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .default_strategy();
        Self {
            store,
            remote,
            breaker,
            resolver,
            bus,
            config,
            strategy,
        }
    }

    fn checkpoint_key(&self, direction: &str) -> String {
        format!("{}:{}", direction, self.remote.url())
    }

    /// Bound a remote call by the configured request timeout
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        let timeout = self.config.timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| SyncError::Timeout {
                operation,
                after: timeout,
            })?
    }

    /// Check that the remote answers
    pub async fn connect(&self) -> SyncResult<()> {
        let timeout = self.config.connect_timeout();
        let info = tokio::time::timeout(timeout, self.remote.info())
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "connect",
                after: timeout,
            })??;
        info!(
            remote = %self.remote.url(),
            db = %info.db_name,
            docs = info.doc_count,
            "Connected to remote"
        );
        Ok(())
    }

    /// Run one pass through the circuit breaker
    ///
    /// `Pull` only pulls; `Sync` pulls then pushes.
    pub async fn run_cycle(&self, direction: Direction) -> SyncResult<CycleStats> {
        let context = direction.context();
        self.bus.set_status(SyncStatus::Syncing);

        let result = self
            .breaker
            .execute(context, self.breaker.max_sync_duration(), move || async move {
                let mut stats = self.pull_once().await?;
                if direction == Direction::Sync {
                    stats.merge(self.push_once().await?);
                }
                Ok(stats)
            })
            .await;

        let mut resolver = self.resolver.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(stats) => {
                resolver.note_success();
                debug!(context, ?stats, "Replication cycle complete");
            }
            Err(SyncError::CircuitOpen) => {}
            Err(_) => resolver.note_error(),
        }
        result
    }

    // ==================== Pull ====================

    /// Pull remote changes since the last checkpoint
    pub async fn pull_once(&self) -> SyncResult<CycleStats> {
        let key = self.checkpoint_key("pull");
        let mut since = self
            .store
            .checkpoint(&key)?
            .unwrap_or_else(|| INITIAL_SEQ.to_string());
        let batch_size = self.config.batch_size.max(1);
        let mut stats = CycleStats::default();

        for _ in 0..self.config.batch_limit.max(1) {
            let batch = self
                .bounded("changes", self.remote.changes(&since, batch_size))
                .await?;
            if batch.results.is_empty() {
                break;
            }

            let mut wanted = Vec::new();
            for change in &batch.results {
                let rev = change
                    .rev
                    .parse()
                    .map_err(|_| SyncError::Protocol(format!("Invalid revision '{}'", change.rev)))?;
                if self.store.knows_revision(&change.id, &rev)? {
                    stats.skipped += 1;
                } else {
                    wanted.push((change.id.clone(), change.rev.clone()));
                }
            }

            let docs = self.bounded("bulk_get", self.remote.bulk_get(&wanted)).await?;
            for remote in docs {
                self.apply_remote(remote, &mut stats)?;
            }

            since = batch.last_seq;
            self.store.set_checkpoint(&key, &since)?;
            if batch.results.len() < batch_size {
                break;
            }
        }

        Ok(stats)
    }

    fn apply_remote(&self, remote: RemoteDoc, stats: &mut CycleStats) -> SyncResult<()> {
        let id = remote.doc.id.clone();
        let Some(local) = self.store.current(&id)? else {
            self.store.put_replicated(&remote.doc, &remote.history)?;
            stats.pulled += 1;
            return Ok(());
        };

        let local_rev = local
            .revision()?
            .ok_or_else(|| SyncError::Protocol(format!("Local '{}' has no revision", id)))?;

        if remote.history.contains(&local_rev) {
            self.store.put_replicated(&remote.doc, &remote.history)?;
            stats.pulled += 1;
            return Ok(());
        }

        // Remote revision is an ancestor of ours: we are ahead
        if let Some(remote_rev) = remote.doc.revision()? {
            if self.store.knows_revision(&id, &remote_rev)? {
                stats.skipped += 1;
                return Ok(());
            }
        }

        self.resolve(local, remote, stats)
    }

    fn resolve(&self, local: Document, remote: RemoteDoc, stats: &mut CycleStats) -> SyncResult<()> {
        let resolution = self
            .resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve_conflict(&local, &remote.doc, "pull", self.strategy);

        stats.conflicts += 1;
        self.breaker.record_conflict(
            "pull",
            &format!(
                "{}: local {} vs remote {}",
                local.id,
                local.rev.as_deref().unwrap_or("-"),
                remote.doc.rev.as_deref().unwrap_or("-")
            ),
        );
        self.bus.emit(SyncEvent::ConflictResolved {
            context: "pull".to_string(),
            document_id: local.id.clone(),
            winner: resolution.winner,
            confidence: resolution.confidence,
        });

        match resolution.winner {
            Winner::Remote => {
                self.store.put_replicated(&remote.doc, &remote.history)?;
                stats.pulled += 1;
            }
            Winner::Local => {
                // Re-parent our body onto the remote head so the next push supersedes it
                self.store.supersede(&local, &remote.history)?;
            }
        }
        Ok(())
    }

    // ==================== Push ====================

    /// Push local changes since the last checkpoint
    pub async fn push_once(&self) -> SyncResult<CycleStats> {
        let key = self.checkpoint_key("push");
        let mut since: i64 = self
            .store
            .checkpoint(&key)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let batch_size = self.config.batch_size.max(1);
        let mut stats = CycleStats::default();

        for _ in 0..self.config.batch_limit.max(1) {
            let changes = self.store.local_changes_since(since, batch_size)?;
            let Some(last) = changes.last().map(|c| c.seq) else {
                break;
            };

            // Only revisions that are still current; later edits supersede earlier ones
            let mut current: BTreeMap<String, Document> = BTreeMap::new();
            for change in &changes {
                if is_internal(change.id()) {
                    continue;
                }
                if let Some(doc) = self.store.current(change.id())? {
                    if doc.rev.as_deref() == Some(change.rev()) {
                        current.insert(doc.id.clone(), doc);
                    }
                }
            }

            let revs: RevsMap = current
                .values()
                .filter_map(|d| Some((d.id.clone(), vec![d.rev.clone()?])))
                .collect();
            let missing = self.bounded("revs_diff", self.remote.revs_diff(&revs)).await?;

            let mut upload = Vec::new();
            for id in missing.keys() {
                let Some(doc) = current.remove(id) else {
                    continue;
                };
                let Some(rev) = doc.revision()? else {
                    continue;
                };
                let revs = self.store.revision_history(id, &rev)?;
                let history = RevisionHistory::from_revs(&revs)
                    .ok_or_else(|| SyncError::Protocol(format!("No history for '{}'", id)))?;
                upload.push(RemoteDoc { doc, history });
            }

            if !upload.is_empty() {
                self.bounded("bulk_docs", self.remote.bulk_docs(&upload))
                    .await?;
                stats.pushed += upload.len();
                self.announce_pushed(&upload);
            }

            since = last;
            self.store.set_checkpoint(&key, &since.to_string())?;
            if changes.len() < batch_size {
                break;
            }
        }

        Ok(stats)
    }

    fn announce_pushed(&self, pushed: &[RemoteDoc]) {
        for remote in pushed.iter().filter(|r| is_task_related(&r.doc)) {
            let notification = ChangeNotification {
                document_id: remote.doc.id.clone(),
                change_type: classify_change(&remote.doc, remote.history.depth()),
                is_task_related: true,
                document: remote.doc.clone(),
                source: ChangeSource::Push,
                timestamp: Utc::now(),
            };
            self.bus
                .emit(SyncEvent::ChangeNotification(freeze_data(&notification)));
        }
    }
}

/// Running replication task
pub struct ReplicationHandle {
    direction: Direction,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Spawn a one-shot pull
    pub fn spawn_pull(
        replicator: Arc<Replicator>,
        reports: mpsc::UnboundedSender<CycleReport>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(async move {
            let outcome = replicator.run_cycle(Direction::Pull).await;
            let _ = reports.send(CycleReport {
                direction: Direction::Pull,
                outcome,
            });
        });
        Self {
            direction: Direction::Pull,
            wake,
            task,
        }
    }

    /// Spawn live bidirectional replication
    ///
    /// With `remote.live = false` a single cycle runs. With `remote.retry =
    /// false` the loop stops after the first failed cycle.
    pub fn spawn_sync(
        replicator: Arc<Replicator>,
        reports: mpsc::UnboundedSender<CycleReport>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(live_loop(replicator, Arc::clone(&wake), reports));
        Self {
            direction: Direction::Sync,
            wake,
            task,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run the next cycle now instead of waiting for the poll interval
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait until it has stopped
    pub async fn cancel(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!(direction = ?self.direction, "Replication handle cancelled");
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn live_loop(
    replicator: Arc<Replicator>,
    wake: Arc<Notify>,
    reports: mpsc::UnboundedSender<CycleReport>,
) {
    let mut seq_rx = replicator.store.subscribe_seq();
    let poll_interval = replicator.config.poll_interval();
    let live = replicator.config.live;
    let retry = replicator.config.retry;
    info!(remote = %replicator.remote.url(), live, "Live replication started");

    loop {
        seq_rx.borrow_and_update();
        let outcome = replicator.run_cycle(Direction::Sync).await;
        let failed = matches!(&outcome, Err(e) if !matches!(e, SyncError::CircuitOpen));

        let report = CycleReport {
            direction: Direction::Sync,
            outcome,
        };
        if reports.send(report).is_err() || !live || (failed && !retry) {
            break;
        }

        let wait = replicator
            .breaker
            .cooldown_remaining()
            .map_or(poll_interval, |cooldown| cooldown.max(Duration::from_millis(1)));

        tokio::select! {
            changed = seq_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Live replication stopped");
}
