//! Remote replication endpoint
//!
//! The engine talks to the remote through [`RemoteStore`], a small subset of
//! the CouchDB replication protocol:
//!
//! - `info`: database metadata, used as a connectivity check
//! - `changes`: winning revision per changed document since a sequence
//! - `bulk_get`: documents with their `_revisions` ancestry
//! - `revs_diff`: which of our revisions the remote is missing
//! - `bulk_docs`: upload revisions as-is (`new_edits: false`)
//!
//! [`CouchRemote`] speaks it over HTTP; [`MemoryRemote`] is an in-process
//! stand-in with the same conflict semantics.

mod couch;
mod memory;

pub use couch::CouchRemote;
pub use memory::MemoryRemote;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, RevisionHistory};
use crate::error::SyncResult;

/// Sequence the remote feed starts from
pub const INITIAL_SEQ: &str = "0";

/// Remote database metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default, deserialize_with = "seq_string")]
    pub update_seq: String,
}

/// One entry of the remote changes feed
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub seq: String,
    pub id: String,
    pub rev: String,
    pub deleted: bool,
}

/// A page of the remote changes feed
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesBatch {
    pub results: Vec<RemoteChange>,
    pub last_seq: String,
}

/// A document revision together with its ancestry
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDoc {
    pub doc: Document,
    pub history: RevisionHistory,
}

impl RemoteDoc {
    /// Split `_revisions` out of a wire document
    pub fn from_wire(mut doc: Document) -> Option<Self> {
        let history = match doc.take_revisions() {
            Some(history) => history,
            None => {
                let rev = doc.revision().ok()??;
                RevisionHistory::from_revs(&[rev])?
            }
        };
        doc.strip_reserved();
        Some(Self { doc, history })
    }

    /// Wire form with `_revisions` attached
    pub fn to_wire(&self) -> SyncResult<Value> {
        let mut value = serde_json::to_value(&self.doc).map_err(crate::storage::StoreError::from)?;
        if let Value::Object(ref mut map) = value {
            map.insert(
                "_revisions".to_string(),
                serde_json::to_value(&self.history).map_err(crate::storage::StoreError::from)?,
            );
        }
        Ok(value)
    }
}

/// Revisions per document id
pub type RevsMap = BTreeMap<String, Vec<String>>;

/// Replication endpoint
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Location used in logs and errors
    fn url(&self) -> &str;

    async fn info(&self) -> SyncResult<RemoteInfo>;

    async fn changes(&self, since: &str, limit: usize) -> SyncResult<ChangesBatch>;

    /// Fetch specific revisions, each with its ancestry
    async fn bulk_get(&self, revs: &[(String, String)]) -> SyncResult<Vec<RemoteDoc>>;

    /// Return the subset of `revs` the remote does not have
    async fn revs_diff(&self, revs: &RevsMap) -> SyncResult<RevsMap>;

    /// Store revisions exactly as given
    async fn bulk_docs(&self, docs: &[RemoteDoc]) -> SyncResult<()>;
}

/// CouchDB sequences are integers (1.x) or opaque strings (2.x+)
pub(crate) fn seq_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => INITIAL_SEQ.to_string(),
        other => other.to_string(),
    }
}

fn seq_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| seq_to_string(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_doc_wire_roundtrip() {
        let doc: Document = serde_json::from_value(json!({
            "_id": "task-1",
            "_rev": "2-b",
            "_revisions": { "start": 2, "ids": ["b", "a"] },
            "title": "x"
        }))
        .unwrap();

        let remote = RemoteDoc::from_wire(doc).unwrap();
        assert_eq!(remote.history.depth(), 2);
        assert!(!remote.doc.body.contains_key("_revisions"));

        let wire = remote.to_wire().unwrap();
        assert_eq!(wire["_revisions"]["start"], 2);
        assert_eq!(wire["_rev"], "2-b");
    }

    #[test]
    fn test_from_wire_without_revisions() {
        let doc: Document = serde_json::from_value(json!({ "_id": "task-1", "_rev": "1-a" })).unwrap();
        let remote = RemoteDoc::from_wire(doc).unwrap();
        assert_eq!(remote.history.ids, vec!["a"]);

        assert!(RemoteDoc::from_wire(Document::new("no-rev")).is_none());
    }

    #[test]
    fn test_info_accepts_numeric_and_string_seq() {
        let info: RemoteInfo =
            serde_json::from_value(json!({ "db_name": "tasks", "update_seq": 12 })).unwrap();
        assert_eq!(info.update_seq, "12");

        let info: RemoteInfo =
            serde_json::from_value(json!({ "db_name": "tasks", "update_seq": "12-g1AAAA" })).unwrap();
        assert_eq!(info.update_seq, "12-g1AAAA");
    }
}
