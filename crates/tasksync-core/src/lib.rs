//! tasksync Core Library
//!
//! This crate provides the sync engine for tasksync, a local-first task
//! manager that replicates a local document store with a CouchDB-compatible
//! remote.
//!
//! # Architecture
//!
//! - **Local store**: SQLite-backed revisioned documents; the source of truth
//!   the application reads and writes
//! - **Replication**: pull and live bidirectional cycles against a
//!   [`RemoteStore`], gated by a health-scored [`CircuitBreaker`]
//! - **Conflicts**: adjudicated by [`ConflictResolver`] (last write wins by
//!   default) and recorded in an audit log
//! - **Propagation**: changes made by any process on the same store are
//!   classified and broadcast as [`SyncEvent`]s
//!
//! Sync is enabled progressively: disabled, then read-only, then
//! write-enabled once the first pull settles cleanly.
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.init().await?;
//!
//! let mut events = engine.subscribe();
//! engine.store().put(&Document::new("task-1").with_field("title", "Write docs"))?;
//!
//! let mode = engine.enable_progressive_sync().await?;
//! ```
//!
//! # Modules
//!
//! - `engine`: Orchestrator and read-only view (main entry point)
//! - `breaker`: Circuit breaker and health scoring
//! - `resolver`: Conflict resolution and audit log
//! - `propagator`: Cross-process change notifications
//! - `guard`: Change deduplication and frozen payloads
//! - `replication`: Pull/push cycles and replication handles
//! - `remote`: Remote endpoint trait, HTTP and in-memory implementations
//! - `storage`: SQLite document store and change feed
//! - `document`: Documents and revisions
//! - `events`: Event bus and status types
//! - `config`: Application configuration

pub mod breaker;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod propagator;
pub mod remote;
pub mod replication;
pub mod resolver;
pub mod storage;

pub use breaker::{CircuitBreaker, CircuitBreakerMetrics, HealthBand, HealthReport};
pub use config::Config;
pub use document::{Document, Revision, RevisionHistory};
pub use engine::{ActiveHandles, EngineView, ProgressiveSyncStatus, SyncEngine};
pub use error::{ErrorCategory, SyncError, SyncResult};
pub use events::{
    ChangeNotification, ChangeSource, ChangeType, EventBus, SyncErrorEvent, SyncEvent, SyncMode,
    SyncStatus,
};
pub use guard::{freeze_data, ChangeDetectionGuard, Frozen};
pub use remote::{CouchRemote, MemoryRemote, RemoteStore};
pub use resolver::{ConflictRecord, ConflictResolver, ConflictStrategy, ResolverStatistics, Winner};
pub use storage::{ChangeOrigin, LocalStore, StoreError};
