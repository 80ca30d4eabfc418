//! In-process remote
//!
//! A multi-master document store with CouchDB's deterministic winner rule,
//! used by tests and the CLI demo mode. Faults can be injected to exercise
//! the breaker and the progressive state machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChangesBatch, RemoteChange, RemoteDoc, RemoteInfo, RemoteStore, RevsMap, INITIAL_SEQ};
use crate::document::{Document, Revision, RevisionHistory};
use crate::error::{SyncError, SyncResult};
use crate::storage::StoreError;

const MEMORY_URL: &str = "memory://tasks";

#[derive(Debug, Default)]
struct MemoryDoc {
    /// Every known revision with its ancestry
    revs: HashMap<String, RemoteDoc>,
    seq: u64,
}

impl MemoryDoc {
    /// Leaf revisions: not an ancestor of any other known revision
    fn leaves(&self) -> Vec<&RemoteDoc> {
        self.revs
            .values()
            .filter(|candidate| {
                let Ok(Some(rev)) = candidate.doc.revision() else {
                    return false;
                };
                !self.revs.values().any(|other| {
                    other.doc.rev != candidate.doc.rev && other.history.contains(&rev)
                })
            })
            .collect()
    }

    /// Winning revision: live leaves beat deleted ones, then highest revision
    fn winner(&self) -> Option<&RemoteDoc> {
        self.leaves().into_iter().max_by(|a, b| {
            let rank = |d: &RemoteDoc| (!d.doc.deleted, d.doc.revision().ok().flatten());
            rank(a).cmp(&rank(b))
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, MemoryDoc>,
    seq: u64,
    fail_next: u32,
    unreachable: bool,
    auth_failure: bool,
    latency: Duration,
    requests: u64,
}

/// Shared in-memory remote; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Fault injection ====================

    /// Fail the next `n` requests with a connectivity error
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Fail every request with a connectivity error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Reject every request with HTTP 401
    pub fn set_auth_failure(&self, failing: bool) {
        self.state().auth_failure = failing;
    }

    /// Delay every request
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Requests served or rejected so far
    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    async fn request(&self) -> SyncResult<()> {
        let latency = {
            let mut state = self.state();
            state.requests += 1;
            if state.auth_failure {
                return Err(SyncError::Auth {
                    url: MEMORY_URL.to_string(),
                    status: 401,
                });
            }
            if state.unreachable || state.fail_next > 0 {
                state.fail_next = state.fail_next.saturating_sub(1);
                return Err(SyncError::Connectivity {
                    url: MEMORY_URL.to_string(),
                    details: "connection refused".to_string(),
                });
            }
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    // ==================== Direct access ====================

    /// Write as another client of the remote would
    ///
    /// Follows the same revision rules as the local store: new documents
    /// carry no `_rev`, updates carry the current winning one.
    pub fn put(&self, doc: &Document) -> SyncResult<Document> {
        let mut state = self.state();
        let current = state.docs.get(&doc.id).and_then(|d| d.winner()).cloned();
        let requested = doc.revision()?;

        let history = match current {
            None if requested.is_none() => RevisionHistory::from_revs(&[Revision::first()]),
            Some(cur) => {
                let current_rev = cur.doc.revision()?;
                let resurrect = cur.doc.deleted && requested.is_none();
                if resurrect || (requested.is_some() && current_rev == requested) {
                    extend(&cur.history)
                } else {
                    None
                }
            }
            None => None,
        }
        .ok_or_else(|| StoreError::Conflict { id: doc.id.clone() })?;

        let mut stored = doc.clone();
        stored.rev = history.revisions().first().map(ToString::to_string);
        stored.strip_reserved();
        insert(
            &mut state,
            RemoteDoc {
                doc: stored.clone(),
                history,
            },
        );
        Ok(stored)
    }

    /// Current winning revision of a document, tombstones included
    pub fn get(&self, id: &str) -> Option<Document> {
        self.state()
            .docs
            .get(id)
            .and_then(|d| d.winner())
            .map(|d| d.doc.clone())
    }

    /// Every leaf revision of a document (more than one means a conflict)
    pub fn leaf_revisions(&self, id: &str) -> Vec<String> {
        let state = self.state();
        let mut revs: Vec<String> = state
            .docs
            .get(id)
            .map(|d| d.leaves().iter().filter_map(|l| l.doc.rev.clone()).collect())
            .unwrap_or_default();
        revs.sort();
        revs
    }

    /// Number of live documents
    pub fn doc_count(&self) -> u64 {
        self.state()
            .docs
            .values()
            .filter(|d| d.winner().is_some_and(|w| !w.doc.deleted))
            .count() as u64
    }
}

fn extend(history: &RevisionHistory) -> Option<RevisionHistory> {
    let mut revs = history.revisions();
    let next = revs.first()?.next();
    revs.insert(0, next);
    RevisionHistory::from_revs(&revs)
}

fn insert(state: &mut MemoryState, remote: RemoteDoc) {
    state.seq += 1;
    let seq = state.seq;
    let entry = state.docs.entry(remote.doc.id.clone()).or_default();
    entry.seq = seq;
    if let Some(rev) = remote.doc.rev.clone() {
        entry.revs.insert(rev, remote);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn url(&self) -> &str {
        MEMORY_URL
    }

    async fn info(&self) -> SyncResult<RemoteInfo> {
        self.request().await?;
        let state = self.state();
        let doc_count = state
            .docs
            .values()
            .filter(|d| d.winner().is_some_and(|w| !w.doc.deleted))
            .count() as u64;
        Ok(RemoteInfo {
            db_name: "tasks".to_string(),
            doc_count,
            update_seq: state.seq.to_string(),
        })
    }

    async fn changes(&self, since: &str, limit: usize) -> SyncResult<ChangesBatch> {
        self.request().await?;
        let since: u64 = if since == INITIAL_SEQ {
            0
        } else {
            since
                .parse()
                .map_err(|_| SyncError::Protocol(format!("Invalid since value '{}'", since)))?
        };

        let state = self.state();
        let mut changed: Vec<(&String, &MemoryDoc)> =
            state.docs.iter().filter(|(_, d)| d.seq > since).collect();
        changed.sort_by_key(|(_, d)| d.seq);

        let results: Vec<RemoteChange> = changed
            .into_iter()
            .take(limit)
            .filter_map(|(id, d)| {
                let winner = d.winner()?;
                Some(RemoteChange {
                    seq: d.seq.to_string(),
                    id: id.clone(),
                    rev: winner.doc.rev.clone()?,
                    deleted: winner.doc.deleted,
                })
            })
            .collect();

        let last_seq = results
            .last()
            .map(|c| c.seq.clone())
            .unwrap_or_else(|| since.to_string());
        Ok(ChangesBatch { results, last_seq })
    }

    async fn bulk_get(&self, revs: &[(String, String)]) -> SyncResult<Vec<RemoteDoc>> {
        self.request().await?;
        let state = self.state();
        Ok(revs
            .iter()
            .filter_map(|(id, rev)| state.docs.get(id)?.revs.get(rev).cloned())
            .collect())
    }

    async fn revs_diff(&self, revs: &RevsMap) -> SyncResult<RevsMap> {
        self.request().await?;
        let state = self.state();
        Ok(revs
            .iter()
            .filter_map(|(id, wanted)| {
                let missing: Vec<String> = wanted
                    .iter()
                    .filter(|rev| {
                        state
                            .docs
                            .get(id)
                            .map_or(true, |d| !d.revs.contains_key(rev.as_str()))
                    })
                    .cloned()
                    .collect();
                (!missing.is_empty()).then(|| (id.clone(), missing))
            })
            .collect())
    }

    async fn bulk_docs(&self, docs: &[RemoteDoc]) -> SyncResult<()> {
        self.request().await?;
        let mut state = self.state();
        for remote in docs {
            if remote.doc.rev.is_none() {
                return Err(SyncError::Protocol(format!(
                    "Document '{}' has no revision",
                    remote.doc.id
                )));
            }
            insert(&mut state, remote.clone());
        }
        Ok(())
    }
}
