//! Storage layer
//!
//! The local half of local-first sync: an embedded SQLite document store with
//! revision trees, an append-only change log, and a live change feed.
//!
//! ## Architecture
//!
//! - **documents**: current revision of each document (tombstones included)
//! - **revisions**: parent pointers, used for ancestry checks during replication
//! - **changes**: sequence-numbered log backing the feed and checkpoints

pub mod error;
pub mod feed;
pub mod local;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use feed::{ChangeFeed, FeedEvent};
pub use local::{ChangeOrigin, LocalStore, StoredChange};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
