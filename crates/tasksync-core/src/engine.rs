//! Sync orchestration
//!
//! [`SyncEngine`] is the single owner of sync state in a process: the local
//! store handle, replication handles, circuit breaker and conflict resolver.
//! Construct one at startup and pass clones to collaborators; collaborators
//! observe it through [`EngineView`] and the event bus, and write only through
//! the local store.
//!
//! Sync is enabled progressively:
//!
//! ```text
//! disabled --enable--> read-only --settle window ok--> write-enabled
//!     ^                    |  ^                              |
//!     +-- setup failure ---+  +--- conflict rate / health ---+
//!     ^                                                      |
//!     +-------------- auth failures / destroy() -------------+
//! ```
//!
//! Replication I/O errors never reach callers. They land in a bounded error
//! log and in `SyncStatus::Error`; local data stays usable throughout. Only
//! misuse (calling before `init()`, after `destroy()`, or without a remote)
//! is returned as an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerMetrics, HealthReport};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncErrorEvent, SyncEvent, SyncMode, SyncStatus};
use crate::propagator::ChangePropagator;
use crate::remote::{CouchRemote, RemoteStore};
use crate::replication::{CycleReport, Direction, ReplicationHandle, Replicator};
use crate::resolver::{ConflictRecord, ConflictResolver, ResolverStatistics};
use crate::storage::LocalStore;

/// Conflict audit log, stored next to the database file
const CONFLICT_LOG_FILE: &str = "conflicts.json";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Number of running replication handles by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActiveHandles {
    pub bidirectional: usize,
    pub one_directional: usize,
}

/// Progressive enablement snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ProgressiveSyncStatus {
    pub mode: SyncMode,
    pub status: SyncStatus,
    pub is_progressive_sync_ready: bool,
    pub health: HealthReport,
    pub conflict_rate: f64,
    pub can_sync: bool,
    pub online: bool,
    /// Why the engine is not (or no longer) write-enabled
    pub reason: Option<String>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub handles: ActiveHandles,
}

#[derive(Default)]
struct Handles {
    pull: Option<ReplicationHandle>,
    live: Option<ReplicationHandle>,
}

#[derive(Debug, Default)]
struct Progress {
    ready: bool,
    reason: Option<String>,
    auth_failures: u32,
    promoted_at: Option<DateTime<Utc>>,
}

struct EngineInner {
    config: Config,
    store: LocalStore,
    breaker: Arc<CircuitBreaker>,
    resolver: Arc<Mutex<ConflictResolver>>,
    bus: EventBus,
    replicator: Option<Arc<Replicator>>,
    init: OnceCell<()>,
    destroyed: AtomicBool,
    online: AtomicBool,
    /// Serializes mode transitions
    transition: tokio::sync::Mutex<()>,
    mode: watch::Sender<SyncMode>,
    handles: Mutex<Handles>,
    propagator: Mutex<Option<ChangePropagator>>,
    progress: Mutex<Progress>,
    errors: Mutex<VecDeque<SyncErrorEvent>>,
}

impl EngineInner {
    fn mode(&self) -> SyncMode {
        *self.mode.borrow()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Switch modes; once destroyed only `Disabled` is accepted
    fn set_mode(&self, mode: SyncMode) {
        let changed = self.mode.send_if_modified(|current| {
            if *current == mode || (mode != SyncMode::Disabled && self.is_destroyed()) {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            self.mode_changed(mode);
        }
    }

    /// Mark progressive sync ready and switch to write-enabled
    ///
    /// The destroyed check and the switch happen under the mode channel's
    /// lock, so a concurrent `destroy()` always has the last word.
    fn promote(&self) -> bool {
        let mut promoted = false;
        let changed = self.mode.send_if_modified(|current| {
            if self.is_destroyed() {
                return false;
            }
            let mut progress = lock(&self.progress);
            progress.ready = true;
            progress.reason = None;
            progress.promoted_at = Some(Utc::now());
            promoted = true;

            let changed = *current != SyncMode::WriteEnabled;
            *current = SyncMode::WriteEnabled;
            changed
        });
        if changed {
            self.mode_changed(SyncMode::WriteEnabled);
        }
        promoted
    }

    fn mode_changed(&self, mode: SyncMode) {
        info!(%mode, "Sync mode changed");
        self.bus.emit(SyncEvent::ModeChanged(mode));
    }

    fn not_ready(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(%reason, "Progressive sync not ready");
        let mut progress = lock(&self.progress);
        progress.ready = false;
        progress.reason = Some(reason);
    }

    fn record_error(&self, context: &str, error: &SyncError) {
        warn!(context, category = %error.category(), "Sync error: {}", error);
        if error.is_auth() {
            lock(&self.progress).auth_failures += 1;
        }

        let event = self.bus.report_error(context, error);
        let capacity = self.config.progressive.error_log_capacity.max(1);
        let mut log = lock(&self.errors);
        log.push_back(event);
        while log.len() > capacity {
            log.pop_front();
        }
    }

    fn active_handles(&self) -> ActiveHandles {
        let handles = lock(&self.handles);
        let running = |h: &Option<ReplicationHandle>| {
            usize::from(h.as_ref().is_some_and(|h| !h.is_finished()))
        };
        ActiveHandles {
            bidirectional: running(&handles.live),
            one_directional: running(&handles.pull),
        }
    }

    fn progressive_status(&self) -> ProgressiveSyncStatus {
        let handles = self.active_handles();
        // Mode first: promote() takes the progress lock inside the mode channel
        let mode = self.mode();
        let progress = lock(&self.progress);
        ProgressiveSyncStatus {
            mode,
            status: self.bus.status(),
            is_progressive_sync_ready: progress.ready,
            health: self.breaker.health_report(),
            conflict_rate: self.breaker.get_conflict_rate(),
            can_sync: self.breaker.can_sync(),
            online: self.online.load(Ordering::SeqCst),
            reason: progress.reason.clone(),
            promoted_at: progress.promoted_at,
            handles,
        }
    }
}

/// Process-wide sync engine; clones share state
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine over an open store and an optional remote
    pub fn new(config: Config, store: LocalStore, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        let breaker = Arc::new(
            CircuitBreaker::new(config.breaker.clone())
                .with_ready_score(config.progressive.min_health_score),
        );
        let resolver = Arc::new(Mutex::new(build_resolver(&config, &store)));
        let bus = EventBus::new();

        let replicator = remote.map(|remote| {
            Arc::new(Replicator::new(
                store.clone(),
                remote,
                Arc::clone(&breaker),
                Arc::clone(&resolver),
                bus.clone(),
                config.remote.clone(),
            ))
        });

        let (mode, _) = watch::channel(SyncMode::Disabled);
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                breaker,
                resolver,
                bus,
                replicator,
                init: OnceCell::new(),
                destroyed: AtomicBool::new(false),
                online: AtomicBool::new(true),
                transition: tokio::sync::Mutex::new(()),
                mode,
                handles: Mutex::new(Handles::default()),
                propagator: Mutex::new(None),
                progress: Mutex::new(Progress::default()),
                errors: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Open the store at the configured path and connect to `remote.url`, if set
    pub fn open(config: Config) -> SyncResult<Self> {
        let store = LocalStore::open(&config.store_path())?;
        let remote: Option<Arc<dyn RemoteStore>> = match config.remote.url {
            Some(_) => Some(Arc::new(CouchRemote::new(&config.remote)?)),
            None => None,
        };
        Ok(Self::new(config, store, remote))
    }

    /// Local store; collaborators write documents through it
    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Read-only view of engine state
    pub fn view(&self) -> EngineView {
        EngineView {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.bus.subscribe()
    }

    fn ensure_ready(&self) -> SyncResult<()> {
        if self.inner.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        if self.inner.init.get().is_none() {
            return Err(SyncError::NotInitialized);
        }
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Initialize the engine
    ///
    /// Starts change propagation and, with `sync_enabled`, progressive sync.
    /// Concurrent and repeated calls share one initialization. On a destroyed
    /// engine this is a no-op.
    pub async fn init(&self) -> SyncResult<()> {
        if self.inner.is_destroyed() {
            debug!("init() on destroyed engine ignored");
            return Ok(());
        }
        self.inner
            .init
            .get_or_try_init(|| self.initialize())
            .await?;
        Ok(())
    }

    async fn initialize(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let propagator =
            ChangePropagator::start(inner.store.clone(), inner.bus.clone(), &inner.config.propagation)?;
        *lock(&inner.propagator) = Some(propagator);
        info!(
            store = ?inner.store.path(),
            remote = inner.replicator.is_some(),
            "Sync engine initialized"
        );

        if inner.config.sync_enabled {
            if inner.replicator.is_some() {
                self.progressive_enable().await;
            } else {
                warn!("sync_enabled is set but no remote is configured");
            }
        }
        Ok(())
    }

    /// Tear down for good: cancel replication, stop propagation, close the breaker
    ///
    /// A destroyed engine cannot be re-initialized; construct a new one.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel_handles().await;
        if let Some(propagator) = lock(&inner.propagator).take() {
            propagator.stop();
        }
        inner.breaker.destroy();
        inner.not_ready("Engine destroyed");
        inner.set_mode(SyncMode::Disabled);
        inner.bus.set_status(SyncStatus::Idle);
        info!("Sync engine destroyed");
    }

    // ==================== Progressive enablement ====================

    /// Walk disabled → read-only → write-enabled as far as health allows
    ///
    /// Returns the resulting mode. Replication failures are absorbed and show
    /// up in the mode, status and error log.
    pub async fn enable_progressive_sync(&self) -> SyncResult<SyncMode> {
        self.ensure_ready()?;
        if self.inner.replicator.is_none() {
            return Err(SyncError::NoRemote);
        }
        Ok(self.progressive_enable().await)
    }

    async fn progressive_enable(&self) -> SyncMode {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;

        if inner.is_destroyed() {
            return SyncMode::Disabled;
        }
        let live_running = lock(&inner.handles).live.is_some();
        if inner.mode() == SyncMode::WriteEnabled && live_running {
            return SyncMode::WriteEnabled;
        }
        if !inner.online.load(Ordering::SeqCst) {
            inner.not_ready("Offline; sync resumes when the network is back");
            return inner.mode();
        }
        let Some(replicator) = inner.replicator.clone() else {
            inner.not_ready("No remote configured");
            return inner.mode();
        };

        let progressive = &inner.config.progressive;
        let health = inner.breaker.health_report();
        if health.score < progressive.min_health_score {
            inner.not_ready(format!(
                "Health score {} is below {}",
                health.score, progressive.min_health_score
            ));
            return inner.mode();
        }

        // Establish the connection
        if let Err(e) = replicator.connect().await {
            return self.fail_setup("connect", &e);
        }

        // One-directional pull
        self.cancel_handles().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.install(Direction::Pull, ReplicationHandle::spawn_pull(Arc::clone(&replicator), tx)) {
            return SyncMode::Disabled;
        }
        inner.set_mode(SyncMode::ReadOnly);

        let report = rx.recv().await;
        let pull = lock(&inner.handles).pull.take();
        if let Some(pull) = pull {
            pull.cancel().await;
        }
        match report.map(|r| r.outcome) {
            Some(Ok(stats)) => {
                inner.bus.set_status(SyncStatus::Complete);
                info!(
                    pulled = stats.pulled,
                    conflicts = stats.conflicts,
                    "Read-only pull complete"
                );
            }
            Some(Err(e)) => return self.fail_setup("pull", &e),
            None => return inner.mode(),
        }

        // Settle window, then decide on promotion
        tokio::time::sleep(progressive.settle_window()).await;
        if inner.is_destroyed() {
            return SyncMode::Disabled;
        }

        let conflict_rate = inner.breaker.get_conflict_rate();
        let health = inner.breaker.health_report();
        let conflicts_seen = inner.breaker.metrics().conflict_count > 0;
        let resolver_ready = lock(&inner.resolver).is_ready_for_cross_browser_sync();

        if conflict_rate > progressive.max_conflict_rate {
            inner.not_ready(format!(
                "Conflict rate {:.1}% exceeds {:.1}%",
                conflict_rate, progressive.max_conflict_rate
            ));
            return SyncMode::ReadOnly;
        }
        if !health.is_ready_for_progressive_sync {
            inner.not_ready(format!("Health score {} after pull", health.score));
            return SyncMode::ReadOnly;
        }
        if conflicts_seen && !resolver_ready {
            inner.not_ready("Conflicts seen but none resolved with confidence yet");
            return SyncMode::ReadOnly;
        }

        if !self.start_live(replicator) || !inner.promote() {
            return SyncMode::Disabled;
        }
        SyncMode::WriteEnabled
    }

    fn fail_setup(&self, context: &str, error: &SyncError) -> SyncMode {
        let inner = &self.inner;
        inner.record_error(context, error);
        inner.not_ready(format!("Setup failed during {}: {}", context, error));
        inner.set_mode(SyncMode::Disabled);
        SyncMode::Disabled
    }

    /// Store a handle unless the engine was destroyed meanwhile
    fn install(&self, direction: Direction, handle: ReplicationHandle) -> bool {
        let mut handles = lock(&self.inner.handles);
        if self.inner.is_destroyed() {
            return false;
        }
        match direction {
            Direction::Pull => handles.pull = Some(handle),
            Direction::Sync => handles.live = Some(handle),
        }
        true
    }

    fn start_live(&self, replicator: Arc<Replicator>) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.install(Direction::Sync, ReplicationHandle::spawn_sync(replicator, tx)) {
            return false;
        }
        tokio::spawn(monitor(Arc::downgrade(&self.inner), rx));
        true
    }

    async fn cancel_handles(&self) {
        let taken = {
            let mut handles = lock(&self.inner.handles);
            [handles.pull.take(), handles.live.take()]
        };
        join_all(taken.into_iter().flatten().map(ReplicationHandle::cancel)).await;
    }

    async fn handle_report(&self, report: CycleReport) {
        let inner = &self.inner;
        match report.outcome {
            Ok(stats) => {
                lock(&inner.progress).auth_failures = 0;
                inner.bus.set_status(SyncStatus::Complete);
                debug!(?stats, "Live cycle complete");
            }
            Err(SyncError::CircuitOpen) => {
                debug!("Live cycle skipped, breaker open");
            }
            Err(e) => inner.record_error(report.direction.context(), &e),
        }
        self.evaluate().await;
    }

    /// Re-check health while write-enabled and demote if it regressed
    ///
    /// Runs after every live cycle; callers may also invoke it directly.
    pub async fn evaluate(&self) -> SyncMode {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        let mode = inner.mode();
        if inner.is_destroyed() || mode != SyncMode::WriteEnabled {
            return mode;
        }

        let progressive = &inner.config.progressive;
        let auth_failures = lock(&inner.progress).auth_failures;
        if auth_failures >= progressive.max_auth_failures {
            warn!(auth_failures, "Repeated authentication failures, disabling sync");
            self.cancel_handles().await;
            inner.not_ready(format!("{} consecutive authentication failures", auth_failures));
            inner.set_mode(SyncMode::Disabled);
            return SyncMode::Disabled;
        }

        let conflict_rate = inner.breaker.get_conflict_rate();
        let health = inner.breaker.health_report();
        let regression = if conflict_rate > progressive.max_conflict_rate {
            Some(format!(
                "Conflict rate {:.1}% exceeds {:.1}%",
                conflict_rate, progressive.max_conflict_rate
            ))
        } else if !health.is_ready_for_progressive_sync {
            Some(format!("Health score dropped to {}", health.score))
        } else {
            None
        };

        match regression {
            Some(reason) => {
                warn!(%reason, "Demoting sync to read-only");
                self.cancel_handles().await;
                inner.not_ready(reason);
                inner.set_mode(SyncMode::ReadOnly);
                SyncMode::ReadOnly
            }
            None => SyncMode::WriteEnabled,
        }
    }

    // ==================== Connectivity ====================

    /// React to a network transition
    ///
    /// Going offline cancels replication and pauses; the mode is kept. Coming
    /// back online resumes live replication directly if the engine was
    /// write-enabled.
    pub async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.ensure_ready()?;
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;

        if inner.online.swap(online, Ordering::SeqCst) == online {
            return Ok(());
        }

        if !online {
            info!("Network offline, pausing replication");
            self.cancel_handles().await;
            inner.bus.set_status(SyncStatus::Paused);
            return Ok(());
        }

        info!("Network online");
        inner.bus.set_status(SyncStatus::Idle);
        if inner.mode() == SyncMode::WriteEnabled {
            if let Some(replicator) = inner.replicator.clone() {
                self.cancel_handles().await;
                self.start_live(replicator);
            }
        }
        Ok(())
    }

    /// Ask the live handle to run a cycle now
    pub fn sync_now(&self) {
        if let Some(live) = lock(&self.inner.handles).live.as_ref() {
            live.trigger();
        }
    }

    // ==================== Reporting ====================

    pub fn get_progressive_sync_status(&self) -> ProgressiveSyncStatus {
        self.inner.progressive_status()
    }

    /// Explicit user reset: clear breaker counters, conflict log and error log
    pub fn reset_sync_state(&self) {
        let inner = &self.inner;
        inner.breaker.reset();
        lock(&inner.resolver).clear_audit_log();
        lock(&inner.errors).clear();
        lock(&inner.progress).auth_failures = 0;
        info!("Sync state reset");
    }
}

async fn monitor(engine: Weak<EngineInner>, mut reports: mpsc::UnboundedReceiver<CycleReport>) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        SyncEngine { inner }.handle_report(report).await;
    }
}

fn build_resolver(config: &Config, store: &LocalStore) -> ConflictResolver {
    let Some(path) = store.path() else {
        return ConflictResolver::new(config.resolver.clone());
    };
    let log_path = path.with_file_name(CONFLICT_LOG_FILE);
    match ConflictResolver::with_audit_path(config.resolver.clone(), log_path) {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!("Conflict log unavailable, keeping it in memory: {:#}", e);
            ConflictResolver::new(config.resolver.clone())
        }
    }
}

/// Read-only accessors over engine state
#[derive(Clone)]
pub struct EngineView {
    inner: Arc<EngineInner>,
}

impl EngineView {
    pub fn status(&self) -> SyncStatus {
        self.inner.bus.status()
    }

    pub fn mode(&self) -> SyncMode {
        self.inner.mode()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.bus.subscribe_status()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<SyncMode> {
        self.inner.mode.subscribe()
    }

    /// Recently propagated changes still settling
    pub fn pending_changes(&self) -> usize {
        lock(&self.inner.propagator)
            .as_ref()
            .map_or(0, ChangePropagator::pending_changes)
    }

    pub fn health_report(&self) -> HealthReport {
        self.inner.breaker.health_report()
    }

    pub fn breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.inner.breaker.metrics()
    }

    pub fn can_sync(&self) -> bool {
        self.inner.breaker.can_sync()
    }

    pub fn progressive_status(&self) -> ProgressiveSyncStatus {
        self.inner.progressive_status()
    }

    pub fn is_progressive_sync_ready(&self) -> bool {
        lock(&self.inner.progress).ready
    }

    /// Caught errors, oldest first
    pub fn error_log(&self) -> Vec<SyncErrorEvent> {
        lock(&self.inner.errors).iter().cloned().collect()
    }

    pub fn active_handles(&self) -> ActiveHandles {
        self.inner.active_handles()
    }

    /// Most recent conflict resolutions, newest first
    pub fn conflict_log(&self, limit: usize) -> Vec<ConflictRecord> {
        lock(&self.inner.resolver).get_audit_log(limit)
    }

    pub fn conflict_statistics(&self) -> ResolverStatistics {
        lock(&self.inner.resolver).get_statistics()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.init.get().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::remote::MemoryRemote;
    use std::time::Duration;

    fn engine_with(remote: &MemoryRemote) -> SyncEngine {
        let mut config = Config::default();
        config.remote.url = Some("memory://tasks".to_string());
        SyncEngine::new(
            config,
            LocalStore::open_in_memory().unwrap(),
            Some(Arc::new(remote.clone())),
        )
    }

    #[tokio::test]
    async fn test_contract_errors() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        assert!(matches!(
            engine.enable_progressive_sync().await,
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(
            engine.set_online(false).await,
            Err(SyncError::NotInitialized)
        ));

        let local_only = SyncEngine::new(
            Config::default(),
            LocalStore::open_in_memory().unwrap(),
            None,
        );
        local_only.init().await.unwrap();
        assert!(matches!(
            local_only.enable_progressive_sync().await,
            Err(SyncError::NoRemote)
        ));
        local_only.destroy().await;
        assert!(matches!(
            local_only.enable_progressive_sync().await,
            Err(SyncError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_no_promotion_after_destroy() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();
        engine.destroy().await;

        // A promotion that was already past its last check loses to destroy()
        assert!(!engine.inner.promote());
        engine.inner.set_mode(SyncMode::ReadOnly);

        let view = engine.view();
        assert_eq!(view.mode(), SyncMode::Disabled);
        assert!(!view.is_progressive_sync_ready());
        assert!(view.progressive_status().promoted_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_destroy_during_enable_ends_disabled() {
        let remote = MemoryRemote::new();
        let mut config = Config::default();
        config.remote.url = Some("memory://tasks".to_string());
        config.progressive.settle_window_ms = 1;
        let engine = SyncEngine::new(
            config,
            LocalStore::open_in_memory().unwrap(),
            Some(Arc::new(remote.clone())),
        );
        engine.init().await.unwrap();

        let enabling = tokio::spawn({
            let engine = engine.clone();
            async move { engine.enable_progressive_sync().await }
        });
        tokio::task::yield_now().await;
        engine.destroy().await;
        let _ = enabling.await.unwrap();

        let view = engine.view();
        assert_eq!(view.mode(), SyncMode::Disabled);
        assert!(!view.is_progressive_sync_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotes_to_write_enabled() {
        let remote = MemoryRemote::new();
        remote.put(&Document::new("task-1").with_field("title", "from remote")).unwrap();

        let engine = engine_with(&remote);
        let mut modes = engine.view().subscribe_mode();
        engine.init().await.unwrap();

        let mode = engine.enable_progressive_sync().await.unwrap();
        assert_eq!(mode, SyncMode::WriteEnabled);
        assert!(modes.has_changed().unwrap());

        let view = engine.view();
        assert!(view.is_progressive_sync_ready());
        assert_eq!(
            view.active_handles(),
            ActiveHandles {
                bidirectional: 1,
                one_directional: 0
            }
        );
        assert!(engine.store().get("task-1").unwrap().is_some());

        // Enabling again keeps the single live handle
        engine.enable_progressive_sync().await.unwrap();
        assert_eq!(view.active_handles().bidirectional, 1);

        engine.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_falls_back_to_disabled() {
        let remote = MemoryRemote::new();
        remote.set_unreachable(true);
        let engine = engine_with(&remote);
        engine.init().await.unwrap();

        let mode = engine.enable_progressive_sync().await.unwrap();
        assert_eq!(mode, SyncMode::Disabled);

        let view = engine.view();
        assert_eq!(view.status(), SyncStatus::Error);
        assert_eq!(view.error_log().len(), 1);
        assert_eq!(view.error_log()[0].context, "connect");
        assert!(view.progressive_status().reason.is_some());
        assert_eq!(view.active_handles(), ActiveHandles::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_breaker_blocks_enable() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();

        for _ in 0..3 {
            engine.inner.breaker.record_error("sync", "down");
        }
        let mode = engine.enable_progressive_sync().await.unwrap();
        assert_eq!(mode, SyncMode::Disabled);
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicts_during_settle_keep_read_only() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();

        let breaker = Arc::clone(&engine.inner.breaker);
        let mut modes = engine.view().subscribe_mode();
        let noise = tokio::spawn(async move {
            while *modes.borrow_and_update() != SyncMode::ReadOnly {
                if modes.changed().await.is_err() {
                    return;
                }
            }
            breaker.record_conflict("pull", "task-1");
        });

        let mode = engine.enable_progressive_sync().await.unwrap();
        noise.await.unwrap();
        assert_eq!(mode, SyncMode::ReadOnly);
        assert!(!engine.view().is_progressive_sync_ready());
        assert_eq!(engine.view().active_handles(), ActiveHandles::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_pauses_and_online_resumes() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();
        engine.enable_progressive_sync().await.unwrap();

        engine.set_online(false).await.unwrap();
        let view = engine.view();
        assert_eq!(view.status(), SyncStatus::Paused);
        assert_eq!(view.mode(), SyncMode::WriteEnabled);
        assert_eq!(view.active_handles(), ActiveHandles::default());

        engine.set_online(true).await.unwrap();
        assert_eq!(view.mode(), SyncMode::WriteEnabled);
        assert_eq!(view.active_handles().bidirectional, 1);

        engine.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failures_disable() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();
        engine.enable_progressive_sync().await.unwrap();

        remote.set_auth_failure(true);
        let mut modes = engine.view().subscribe_mode();
        while *modes.borrow_and_update() != SyncMode::Disabled {
            engine.sync_now();
            tokio::time::timeout(Duration::from_secs(600), modes.changed())
                .await
                .expect("engine should disable sync")
                .unwrap();
        }

        let view = engine.view();
        assert_eq!(view.active_handles(), ActiveHandles::default());
        assert!(view.error_log().iter().all(|e| !e.recoverable));
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_reset_sync_state() {
        let remote = MemoryRemote::new();
        let engine = engine_with(&remote);
        engine.init().await.unwrap();

        engine.inner.breaker.record_conflict("pull", "task-1");
        engine.inner.record_error("sync", &SyncError::Protocol("bad".to_string()));
        engine.reset_sync_state();

        let view = engine.view();
        assert_eq!(view.breaker_metrics(), CircuitBreakerMetrics::default());
        assert!(view.error_log().is_empty());
        assert!(view.conflict_log(10).is_empty());
    }

    #[tokio::test]
    async fn test_error_log_is_bounded() {
        let remote = MemoryRemote::new();
        let mut config = Config::default();
        config.progressive.error_log_capacity = 2;
        let engine = SyncEngine::new(
            config,
            LocalStore::open_in_memory().unwrap(),
            Some(Arc::new(remote)),
        );
        for i in 0..5 {
            engine
                .inner
                .record_error("sync", &SyncError::Protocol(format!("error {}", i)));
        }
        let log = engine.view().error_log();
        assert_eq!(log.len(), 2);
        assert!(log[1].message.contains("error 4"));
    }
}
