//! Revision-tracked documents
//!
//! Documents use the CouchDB wire shape: reserved `_id`, `_rev` and `_deleted`
//! members plus an arbitrary JSON body. Revisions are `<generation>-<hash>`
//! strings; the generation grows by one per edit.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::StoreError;

/// Body keys checked (in order) for the modification timestamp
const TIMESTAMP_KEYS: &[&str] = &["updatedAt", "updated_at", "modifiedAt"];

/// A single document revision identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub generation: u64,
    pub hash: String,
}

impl Revision {
    /// Create the first revision of a document
    pub fn first() -> Self {
        Self::with_generation(1)
    }

    /// Create the revision that follows this one
    pub fn next(&self) -> Self {
        Self::with_generation(self.generation + 1)
    }

    fn with_generation(generation: u64) -> Self {
        Self {
            generation,
            hash: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

impl FromStr for Revision {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidRevision(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| StoreError::InvalidRevision(s.to_string()))?;
        if generation == 0 || hash.is_empty() {
            return Err(StoreError::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

/// Deterministic winner order used by multi-master replication:
/// higher generation wins, then the lexicographically greater hash.
impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ancestry of a revision in CouchDB `_revisions` form (newest hash first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Build from full revision strings ordered newest first
    pub fn from_revs(revs: &[Revision]) -> Option<Self> {
        let newest = revs.first()?;
        Some(Self {
            start: newest.generation,
            ids: revs.iter().map(|r| r.hash.clone()).collect(),
        })
    }

    /// Expand into full revisions, newest first
    pub fn revisions(&self) -> Vec<Revision> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, hash)| {
                let generation = self.start.checked_sub(i as u64)?;
                (generation > 0).then(|| Revision {
                    generation,
                    hash: hash.clone(),
                })
            })
            .collect()
    }

    /// Check whether a revision is part of this ancestry
    pub fn contains(&self, rev: &Revision) -> bool {
        if rev.generation > self.start {
            return false;
        }
        let index = (self.start - rev.generation) as usize;
        self.ids.get(index).is_some_and(|h| *h == rev.hash)
    }

    /// Number of revisions in the history
    pub fn depth(&self) -> usize {
        self.ids.len()
    }
}

/// A JSON document with CouchDB-style metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// Create an empty document with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            body: Map::new(),
        }
    }

    /// Create a deletion marker for an existing revision
    pub fn tombstone(id: impl Into<String>, rev: Option<String>) -> Self {
        Self {
            id: id.into(),
            rev,
            deleted: true,
            body: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a body field
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(key.into(), value.into());
    }

    /// Get a body field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Stamp `updatedAt` with the given time (RFC 3339, millisecond precision)
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.set(
            "updatedAt",
            at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
    }

    /// Parse the current revision, if any
    pub fn revision(&self) -> Result<Option<Revision>, StoreError> {
        self.rev.as_deref().map(str::parse).transpose()
    }

    /// Modification timestamp from the body
    ///
    /// Accepts RFC 3339 strings or integer epoch milliseconds. Returns `None`
    /// when no timestamp key is present or the value cannot be interpreted.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        TIMESTAMP_KEYS
            .iter()
            .find_map(|key| self.body.get(*key))
            .and_then(parse_timestamp)
    }

    /// Count body fields carrying a meaningful value
    pub fn populated_field_count(&self) -> usize {
        self.body
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .filter(|(_, v)| match v {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            })
            .count()
    }

    /// Remove and parse a `_revisions` member carried in the body
    pub fn take_revisions(&mut self) -> Option<RevisionHistory> {
        self.body
            .remove("_revisions")
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Drop reserved members other than `_id`/`_rev`/`_deleted`
    pub fn strip_reserved(&mut self) {
        self.body.retain(|k, _| !k.starts_with('_'));
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_revision_parse_and_display() {
        let rev: Revision = "3-abc123".parse().unwrap();
        assert_eq!(rev.generation, 3);
        assert_eq!(rev.hash, "abc123");
        assert_eq!(rev.to_string(), "3-abc123");

        assert!("abc".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("x-abc".parse::<Revision>().is_err());
        assert!("2-".parse::<Revision>().is_err());
    }

    #[test]
    fn test_revision_next_and_order() {
        let first = Revision::first();
        let second = first.next();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(second.hash.len(), 32);
        assert!(second > first);

        let a: Revision = "2-aaa".parse().unwrap();
        let b: Revision = "2-bbb".parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_revision_history() {
        let revs: Vec<Revision> = ["3-c", "2-b", "1-a"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let history = RevisionHistory::from_revs(&revs).unwrap();
        assert_eq!(history.start, 3);
        assert_eq!(history.ids, vec!["c", "b", "a"]);
        assert_eq!(history.depth(), 3);
        assert!(history.contains(&"2-b".parse().unwrap()));
        assert!(!history.contains(&"2-x".parse().unwrap()));
        assert!(!history.contains(&"4-c".parse().unwrap()));
        assert_eq!(history.revisions(), revs);
    }

    #[test]
    fn test_document_serde_shape() {
        let doc = Document::new("task-1")
            .with_field("title", "Write docs")
            .with_field("status", "todo");
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], "task-1");
        assert!(value.get("_rev").is_none());
        assert!(value.get("_deleted").is_none());
        assert_eq!(value["title"], "Write docs");

        let parsed: Document = serde_json::from_value(json!({
            "_id": "task-2",
            "_rev": "1-abc",
            "_deleted": true
        }))
        .unwrap();
        assert!(parsed.deleted);
        assert_eq!(parsed.rev.as_deref(), Some("1-abc"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_updated_at_formats() {
        let doc = Document::new("a").with_field("updatedAt", "2024-05-01T10:00:00.000Z");
        assert_eq!(
            doc.updated_at().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );

        let doc = Document::new("b").with_field("updated_at", 1_714_557_600_000i64);
        assert_eq!(
            doc.updated_at().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );

        let doc = Document::new("c").with_field("updatedAt", "yesterday");
        assert!(doc.updated_at().is_none());
        assert!(Document::new("d").updated_at().is_none());
    }

    #[test]
    fn test_populated_field_count() {
        let doc = Document::new("task-1")
            .with_field("title", "x")
            .with_field("description", "")
            .with_field("subtasks", json!([]))
            .with_field("priority", json!(null))
            .with_field("done", false);
        assert_eq!(doc.populated_field_count(), 2);
    }

    #[test]
    fn test_take_revisions() {
        let mut doc: Document = serde_json::from_value(json!({
            "_id": "task-1",
            "_rev": "2-b",
            "_revisions": { "start": 2, "ids": ["b", "a"] },
            "title": "x"
        }))
        .unwrap();
        let history = doc.take_revisions().unwrap();
        assert_eq!(history.start, 2);
        assert!(!doc.body.contains_key("_revisions"));
        assert_eq!(doc.body.len(), 1);
    }
}
