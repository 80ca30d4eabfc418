//! Embedded revision-tracked document store
//!
//! A SQLite-backed store with CouchDB semantics: every write gets a new
//! revision, stale writes are rejected, deletes leave tombstones, and every
//! change is appended to a sequence-numbered log.
//!
//! Several `LocalStore` handles may open the same database file (one per
//! process or window). Handles cloned from each other share a connection and a
//! sequence watch so the change feed wakes immediately; handles opened
//! separately observe each other through the change log.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::schema::{init_schema, needs_init};
use crate::document::{Document, Revision, RevisionHistory};

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through a local handle
    Local,
    /// Written by replication from the remote
    Pull,
}

impl ChangeOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeOrigin::Local => "local",
            ChangeOrigin::Pull => "pull",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pull" => ChangeOrigin::Pull,
            _ => ChangeOrigin::Local,
        }
    }
}

/// One entry of the change log
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    pub seq: i64,
    pub origin: ChangeOrigin,
    /// Document as written by this change
    pub doc: Document,
}

impl StoredChange {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn rev(&self) -> &str {
        self.doc.rev.as_deref().unwrap_or_default()
    }
}

/// Local document store
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    seq_tx: Arc<watch::Sender<i64>>,
}

impl LocalStore {
    /// Open (or create) a store at the given path
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        debug!(path = %path.display(), "Opened local store");
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        let seq = query_update_seq(&conn)?;
        let (seq_tx, _) = watch::channel(seq);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            seq_tx: Arc::new(seq_tx),
        })
    }

    /// Database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn publish(&self, seq: i64) {
        self.seq_tx.send_replace(seq);
    }

    /// Watch the latest sequence written through this handle (and its clones)
    pub fn subscribe_seq(&self) -> watch::Receiver<i64> {
        self.seq_tx.subscribe()
    }

    // ==================== Documents ====================

    /// Create or update a document
    ///
    /// A new document must not carry `_rev`; an update must carry the current
    /// one. Anything else is rejected as a conflict. Returns the stored
    /// document with its new revision.
    pub fn put(&self, doc: &Document) -> StoreResult<Document> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = current_revision(&tx, &doc.id)?;
        let requested = doc.revision()?;

        let parent = match (current, requested) {
            (None, None) => None,
            (Some((cur, true)), None) => Some(cur),
            (Some((cur, _)), Some(req)) if cur == req => Some(cur),
            _ => {
                return Err(StoreError::Conflict { id: doc.id.clone() });
            }
        };

        let new_rev = parent.as_ref().map(Revision::next).unwrap_or_else(Revision::first);

        let mut stored = doc.clone();
        stored.rev = Some(new_rev.to_string());
        stored.strip_reserved();

        insert_revision(&tx, &stored.id, &new_rev, parent.as_ref())?;
        let seq = write_current(&tx, &stored, ChangeOrigin::Local)?;
        tx.commit()?;
        drop(conn);

        self.publish(seq);
        Ok(stored)
    }

    /// Delete a document, leaving a tombstone revision
    pub fn delete(&self, id: &str, rev: &str) -> StoreResult<Document> {
        match self.get(id)? {
            Some(_) => self.put(&Document::tombstone(id, Some(rev.to_string()))),
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    /// Get a live (non-deleted) document
    pub fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.current(id)?.filter(|d| !d.deleted))
    }

    /// Get the current revision of a document, tombstones included
    pub fn current(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, rev, deleted, body FROM documents WHERE id = ?",
            [id],
            row_to_doc,
        )
        .optional()?
        .transpose()
    }

    /// All live documents, ordered by id
    pub fn all_docs(&self) -> StoreResult<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, rev, deleted, body FROM documents WHERE deleted = 0 ORDER BY id")?;
        let docs = stmt
            .query_map([], row_to_doc)?
            .collect::<Result<Vec<_>, _>>()?;
        docs.into_iter().collect()
    }

    /// Count live documents
    pub fn doc_count(&self) -> StoreResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE deleted = 0",
            [],
            |row| row.get(0),
        )?)
    }

    // ==================== Revisions ====================

    /// Ancestry of a revision, newest first
    pub fn revision_history(&self, id: &str, rev: &Revision) -> StoreResult<Vec<Revision>> {
        let conn = self.lock()?;
        ancestry(&conn, id, rev)
    }

    /// Depth of a revision's ancestry (1 for a freshly created document)
    pub fn revision_depth(&self, id: &str, rev: &str) -> StoreResult<usize> {
        let rev: Revision = rev.parse()?;
        Ok(self.revision_history(id, &rev)?.len().max(1))
    }

    /// Check whether a revision is already known locally
    pub fn knows_revision(&self, id: &str, rev: &Revision) -> StoreResult<bool> {
        let conn = self.lock()?;
        let exists = conn
            .prepare("SELECT 1 FROM revisions WHERE id = ? AND rev = ?")?
            .exists(params![id, rev.to_string()])?;
        Ok(exists)
    }

    /// Record a foreign revision chain without touching the current revision
    pub fn record_history(&self, id: &str, history: &RevisionHistory) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_history(&tx, id, history)?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Replication ====================

    /// Store a replicated revision as the current one
    ///
    /// The document keeps the revision it arrived with. The change is tagged
    /// as pulled so it is never pushed back to where it came from.
    pub fn put_replicated(&self, doc: &Document, history: &RevisionHistory) -> StoreResult<i64> {
        let rev = doc
            .revision()?
            .ok_or_else(|| StoreError::InvalidRevision(String::new()))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if history.depth() > 0 {
            insert_history(&tx, &doc.id, history)?;
        } else {
            insert_revision(&tx, &doc.id, &rev, None)?;
        }

        let mut stored = doc.clone();
        stored.strip_reserved();
        let seq = write_current(&tx, &stored, ChangeOrigin::Pull)?;
        tx.commit()?;
        drop(conn);

        self.publish(seq);
        Ok(seq)
    }

    /// Write a local body as a child of a replicated revision
    ///
    /// Used when a local edit wins a conflict: the new revision descends from
    /// the remote one, so pushing it supersedes the remote branch.
    pub fn supersede(&self, doc: &Document, base: &RevisionHistory) -> StoreResult<Document> {
        let parent = base
            .revisions()
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidRevision(String::new()))?;
        let new_rev = parent.next();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_history(&tx, &doc.id, base)?;
        insert_revision(&tx, &doc.id, &new_rev, Some(&parent))?;

        let mut stored = doc.clone();
        stored.rev = Some(new_rev.to_string());
        stored.strip_reserved();
        let seq = write_current(&tx, &stored, ChangeOrigin::Local)?;
        tx.commit()?;
        drop(conn);

        self.publish(seq);
        Ok(stored)
    }

    /// Highest sequence in the change log (0 when empty)
    pub fn update_seq(&self) -> StoreResult<i64> {
        let conn = self.lock()?;
        Ok(query_update_seq(&conn)?)
    }

    /// Changes after `since`, oldest first
    pub fn changes_since(&self, since: i64, limit: usize) -> StoreResult<Vec<StoredChange>> {
        self.query_changes(
            "SELECT seq, id, rev, deleted, body, origin FROM changes \
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            since,
            limit,
        )
    }

    /// Locally originated changes after `since`, oldest first
    pub fn local_changes_since(&self, since: i64, limit: usize) -> StoreResult<Vec<StoredChange>> {
        self.query_changes(
            "SELECT seq, id, rev, deleted, body, origin FROM changes \
             WHERE seq > ?1 AND origin = 'local' ORDER BY seq LIMIT ?2",
            since,
            limit,
        )
    }

    fn query_changes(&self, sql: &str, since: i64, limit: usize) -> StoreResult<Vec<StoredChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![since, limit as i64], |row| {
                let seq: i64 = row.get(0)?;
                let origin: String = row.get(5)?;
                Ok((seq, origin, doc_at(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, origin, doc)| {
                Ok(StoredChange {
                    seq,
                    origin: ChangeOrigin::parse(&origin),
                    doc: doc?,
                })
            })
            .collect()
    }

    /// Last live version of a document written before `seq`
    ///
    /// Tombstones carry no body; this recovers what was deleted.
    pub fn last_live_before(&self, id: &str, seq: i64) -> StoreResult<Option<Document>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                "SELECT id, rev, deleted, body FROM changes \
                 WHERE id = ?1 AND seq < ?2 AND deleted = 0 ORDER BY seq DESC LIMIT 1",
                params![id, seq],
                row_to_doc,
            )
            .optional()?;
        doc.transpose()
    }

    /// Read a replication checkpoint
    pub fn checkpoint(&self, name: &str) -> StoreResult<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT value FROM checkpoints WHERE name = ?",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write a replication checkpoint
    pub fn set_checkpoint(&self, name: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (name, value) VALUES (?, ?)",
            params![name, value],
        )?;
        Ok(())
    }
}

fn query_update_seq(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| {
        row.get(0)
    })
}

/// Map `(id, rev, deleted, body)` columns
fn row_to_doc(row: &Row<'_>) -> rusqlite::Result<StoreResult<Document>> {
    doc_at(row, 0)
}

/// Map `(id, rev, deleted, body)` columns starting at `offset`
fn doc_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<StoreResult<Document>> {
    let id: String = row.get(offset)?;
    let rev: String = row.get(offset + 1)?;
    let deleted: bool = row.get(offset + 2)?;
    let body: String = row.get(offset + 3)?;

    Ok(serde_json::from_str::<Map<String, Value>>(&body)
        .map(|body| Document {
            id,
            rev: Some(rev),
            deleted,
            body,
        })
        .map_err(StoreError::from))
}

fn current_revision(conn: &Connection, id: &str) -> StoreResult<Option<(Revision, bool)>> {
    let row: Option<(String, bool)> = conn
        .query_row(
            "SELECT rev, deleted FROM documents WHERE id = ?",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(rev, deleted)| Ok((rev.parse()?, deleted)))
        .transpose()
}

fn insert_revision(
    conn: &Connection,
    id: &str,
    rev: &Revision,
    parent: Option<&Revision>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO revisions (id, rev, generation, parent_rev) VALUES (?, ?, ?, ?)",
        params![
            id,
            rev.to_string(),
            rev.generation as i64,
            parent.map(|p| p.to_string())
        ],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, id: &str, history: &RevisionHistory) -> StoreResult<()> {
    let revs = history.revisions();
    for (i, rev) in revs.iter().enumerate() {
        insert_revision(conn, id, rev, revs.get(i + 1))?;
    }
    Ok(())
}

fn ancestry(conn: &Connection, id: &str, rev: &Revision) -> StoreResult<Vec<Revision>> {
    let mut stmt = conn.prepare("SELECT parent_rev FROM revisions WHERE id = ? AND rev = ?")?;
    let mut chain = Vec::new();
    let mut cursor = Some(rev.clone());

    while let Some(current) = cursor {
        let parent: Option<Option<String>> = stmt
            .query_row(params![id, current.to_string()], |row| row.get(0))
            .optional()?;
        chain.push(current);
        cursor = match parent.flatten() {
            Some(p) => Some(p.parse()?),
            None => None,
        };
    }

    Ok(chain)
}

fn write_current(conn: &Connection, doc: &Document, origin: ChangeOrigin) -> StoreResult<i64> {
    let body = serde_json::to_string(&doc.body)?;
    let rev = doc.rev.clone().unwrap_or_default();

    conn.execute(
        "INSERT INTO changes (id, rev, deleted, body, origin) VALUES (?, ?, ?, ?, ?)",
        params![doc.id, rev, doc.deleted, body, origin.as_str()],
    )?;
    let seq = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO documents (id, rev, deleted, body, updated_seq) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            rev = excluded.rev,
            deleted = excluded.deleted,
            body = excluded.body,
            updated_seq = excluded.updated_seq",
        params![doc.id, rev, doc.deleted, body, seq],
    )?;

    Ok(seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(id: &str) -> Document {
        Document::new(id)
            .with_field("title", "Write tests")
            .with_field("status", "todo")
    }

    #[test]
    fn test_put_assigns_first_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let stored = store.put(&task("task-1")).unwrap();

        let rev = stored.revision().unwrap().unwrap();
        assert_eq!(rev.generation, 1);
        assert_eq!(store.get("task-1").unwrap().unwrap(), stored);
        assert_eq!(store.doc_count().unwrap(), 1);
    }

    #[test]
    fn test_update_requires_current_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.put(&task("task-1")).unwrap();

        // No revision on an existing document
        let err = store.put(&task("task-1")).unwrap_err();
        assert!(err.is_conflict());

        // Current revision
        let mut update = first.clone();
        update.set("status", "done");
        let second = store.put(&update).unwrap();
        assert_eq!(second.revision().unwrap().unwrap().generation, 2);

        // Stale revision
        let err = store.put(&update).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_new_document_with_revision_conflicts() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut doc = task("task-1");
        doc.rev = Some("1-abc".to_string());
        assert!(store.put(&doc).unwrap_err().is_conflict());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let store = LocalStore::open_in_memory().unwrap();
        let stored = store.put(&task("task-1")).unwrap();

        let tombstone = store
            .delete("task-1", stored.rev.as_deref().unwrap())
            .unwrap();
        assert!(tombstone.deleted);
        assert!(store.get("task-1").unwrap().is_none());
        assert!(store.current("task-1").unwrap().unwrap().deleted);
        assert_eq!(store.doc_count().unwrap(), 0);

        // Recreate after delete continues the revision chain
        let recreated = store.put(&task("task-1")).unwrap();
        assert_eq!(recreated.revision().unwrap().unwrap().generation, 3);
    }

    #[test]
    fn test_delete_missing_document() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.delete("nope", "1-abc").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_revision_history_and_depth() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.put(&task("task-1")).unwrap();
        let second = store.put(&first).unwrap();
        let third = store.put(&second).unwrap();

        let rev = third.revision().unwrap().unwrap();
        let history = store.revision_history("task-1", &rev).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], rev);
        assert_eq!(history[2], first.revision().unwrap().unwrap());

        assert_eq!(
            store
                .revision_depth("task-1", first.rev.as_deref().unwrap())
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_put_replicated_keeps_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut doc = task("task-9");
        doc.rev = Some("2-bbb".to_string());
        let history = RevisionHistory {
            start: 2,
            ids: vec!["bbb".to_string(), "aaa".to_string()],
        };

        store.put_replicated(&doc, &history).unwrap();

        let current = store.get("task-9").unwrap().unwrap();
        assert_eq!(current.rev.as_deref(), Some("2-bbb"));
        assert!(store
            .knows_revision("task-9", &"1-aaa".parse().unwrap())
            .unwrap());

        // Pulled changes are not local changes
        assert_eq!(store.changes_since(0, 10).unwrap().len(), 1);
        assert!(store.local_changes_since(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_knows_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.put(&task("task-1")).unwrap();
        let rev = first.revision().unwrap().unwrap();

        assert!(store.knows_revision("task-1", &rev).unwrap());
        assert!(!store
            .knows_revision("task-1", &"9-zzz".parse().unwrap())
            .unwrap());
        assert!(!store.knows_revision("task-2", &rev).unwrap());
    }

    #[test]
    fn test_last_live_before_tombstone() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.put(&task("task-1")).unwrap();
        let mut update = first.clone();
        update.set("status", "done");
        let second = store.put(&update).unwrap();
        store.delete("task-1", second.rev.as_deref().unwrap()).unwrap();

        let changes = store.changes_since(0, 10).unwrap();
        let tombstone = changes.last().unwrap();
        assert!(tombstone.doc.deleted);

        let previous = store
            .last_live_before("task-1", tombstone.seq)
            .unwrap()
            .unwrap();
        assert_eq!(previous, second);
        assert!(store.last_live_before("task-1", changes[0].seq).unwrap().is_none());
    }

    #[test]
    fn test_supersede_descends_from_base() {
        let store = LocalStore::open_in_memory().unwrap();
        let base = RevisionHistory {
            start: 3,
            ids: vec!["ccc".into(), "bbb".into(), "aaa".into()],
        };

        let stored = store.supersede(&task("task-1"), &base).unwrap();
        let rev = stored.revision().unwrap().unwrap();
        assert_eq!(rev.generation, 4);

        let history = store.revision_history("task-1", &rev).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(store.local_changes_since(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_changes_since() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.update_seq().unwrap(), 0);

        let a = store.put(&task("task-1")).unwrap();
        store.put(&task("task-2")).unwrap();
        store.put(&a).unwrap();

        let changes = store.changes_since(0, 10).unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].id(), "task-1");
        assert_eq!(changes[2].id(), "task-1");
        assert!(changes[0].seq < changes[1].seq);

        let later = store.changes_since(changes[1].seq, 10).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(store.update_seq().unwrap(), changes[2].seq);

        assert_eq!(store.changes_since(0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoints() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.checkpoint("pull").unwrap().is_none());
        store.set_checkpoint("pull", "42").unwrap();
        store.set_checkpoint("pull", "43").unwrap();
        assert_eq!(store.checkpoint("pull").unwrap().as_deref(), Some("43"));
    }

    #[test]
    fn test_seq_watch_advances_on_write() {
        let store = LocalStore::open_in_memory().unwrap();
        let rx = store.subscribe_seq();
        assert_eq!(*rx.borrow(), 0);

        store.put(&task("task-1")).unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store.put(&task("task-1")).unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.doc_count().unwrap(), 1);
        assert_eq!(store.update_seq().unwrap(), 1);
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_two_handles_share_one_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.db");

        let first = LocalStore::open(&path).unwrap();
        let second = LocalStore::open(&path).unwrap();

        let stored = first.put(&task("task-1")).unwrap();
        assert_eq!(second.get("task-1").unwrap().unwrap(), stored);
        assert_eq!(second.changes_since(0, 10).unwrap().len(), 1);
    }
}
