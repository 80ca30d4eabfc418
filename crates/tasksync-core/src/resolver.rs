//! Conflict resolution
//!
//! Picks a winner between a local and a remote revision of the same document
//! and keeps an audit trail of every decision. Resolution always produces a
//! winner; the confidence value says how much the decision can be trusted:
//!
//! | Situation | Winner | Confidence |
//! |---|---|---|
//! | timestamps present and distinct | later timestamp | 1.0 |
//! | timestamps equal | remote | 0.5 |
//! | a timestamp is missing | more populated fields | 0.25 |
//! | nothing to go on | local | 0.0 |

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::document::Document;

/// Confidence at or above which a resolution counts as high
const HIGH_CONFIDENCE: f64 = 0.75;
/// Confidence at or above which a resolution is trusted for promotion
const TRUSTED_CONFIDENCE: f64 = 0.5;

/// How to pick a winner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Later modification timestamp wins
    #[default]
    LastWriteWins,
    /// Local revision always wins
    LocalWins,
    /// Remote revision always wins
    RemoteWins,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => write!(f, "last-write-wins"),
            ConflictStrategy::LocalWins => write!(f, "local-wins"),
            ConflictStrategy::RemoteWins => write!(f, "remote-wins"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" => Ok(ConflictStrategy::RemoteWins),
            other => anyhow::bail!(
                "Unknown conflict strategy '{}'. Use last-write-wins, local-wins or remote-wins",
                other
            ),
        }
    }
}

/// Which side won
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::Local => write!(f, "local"),
            Winner::Remote => write!(f, "remote"),
        }
    }
}

/// Audit entry for a single resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub document_id: String,
    pub local_revision: Option<String>,
    pub remote_revision: Option<String>,
    pub resolution_strategy: String,
    pub winner: Winner,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of a resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    pub resolved: Document,
    pub winner: Winner,
    pub confidence: f64,
    pub record: ConflictRecord,
}

/// Resolution counts, by winner and by confidence band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStatistics {
    pub total: u64,
    pub local_wins: u64,
    pub remote_wins: u64,
    pub high_confidence: u64,
    pub medium_confidence: u64,
    pub low_confidence: u64,
}

impl ResolverStatistics {
    fn count(&mut self, winner: Winner, confidence: f64) {
        self.total += 1;
        match winner {
            Winner::Local => self.local_wins += 1,
            Winner::Remote => self.remote_wins += 1,
        }
        if confidence >= HIGH_CONFIDENCE {
            self.high_confidence += 1;
        } else if confidence >= TRUSTED_CONFIDENCE {
            self.medium_confidence += 1;
        } else {
            self.low_confidence += 1;
        }
    }
}

/// Conflict resolver with a bounded audit log
#[derive(Debug)]
pub struct ConflictResolver {
    config: ResolverConfig,
    audit_log: VecDeque<ConflictRecord>,
    statistics: ResolverStatistics,
    /// A trusted resolution happened and no error followed yet
    pending_trusted: bool,
    /// A trusted resolution was followed by a successful cycle
    confirmed: bool,
    /// File the audit log is persisted to, if any
    path: Option<PathBuf>,
}

impl ConflictResolver {
    /// Create an in-memory resolver
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            audit_log: VecDeque::new(),
            statistics: ResolverStatistics::default(),
            pending_trusted: false,
            confirmed: false,
            path: None,
        }
    }

    /// Create a resolver whose audit log survives restarts
    ///
    /// Existing records at `path` are loaded; counts are rebuilt from them.
    pub fn with_audit_path(config: ResolverConfig, path: PathBuf) -> Result<Self> {
        let mut resolver = Self::new(config);
        if path.exists() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read conflict log: {}", path.display()))?;
            let records: Vec<ConflictRecord> =
                serde_json::from_str(&json).context("Failed to parse conflict log")?;
            for record in records {
                resolver.statistics.count(record.winner, record.confidence);
                resolver.push_record(record);
            }
        }
        resolver.path = Some(path);
        Ok(resolver)
    }

    /// Default strategy from configuration
    pub fn default_strategy(&self) -> ConflictStrategy {
        self.config.strategy
    }

    /// Resolve a conflict between two revisions of one document
    pub fn resolve_conflict(
        &mut self,
        local: &Document,
        remote: &Document,
        context: &str,
        strategy: ConflictStrategy,
    ) -> Resolution {
        self.resolve_at(local, remote, context, strategy, Utc::now())
    }

    fn resolve_at(
        &mut self,
        local: &Document,
        remote: &Document,
        context: &str,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> Resolution {
        let (winner, confidence, clamped) = match strategy {
            ConflictStrategy::LocalWins => (Winner::Local, 1.0, false),
            ConflictStrategy::RemoteWins => (Winner::Remote, 1.0, false),
            ConflictStrategy::LastWriteWins => self.last_write_wins(local, remote, now),
        };

        let mut resolution_strategy = strategy.to_string();
        if clamped {
            resolution_strategy.push_str(" (future timestamp clamped)");
        }

        let record = ConflictRecord {
            document_id: local.id.clone(),
            local_revision: local.rev.clone(),
            remote_revision: remote.rev.clone(),
            resolution_strategy,
            winner,
            confidence,
            timestamp: now,
        };

        debug!(
            context,
            document_id = %record.document_id,
            winner = %winner,
            confidence,
            "Conflict resolved"
        );

        self.statistics.count(winner, confidence);
        if confidence >= TRUSTED_CONFIDENCE {
            self.pending_trusted = true;
        }
        self.push_record(record.clone());
        self.persist();

        let resolved = match winner {
            Winner::Local => local.clone(),
            Winner::Remote => remote.clone(),
        };

        Resolution {
            resolved,
            winner,
            confidence,
            record,
        }
    }

    fn last_write_wins(
        &self,
        local: &Document,
        remote: &Document,
        now: DateTime<Utc>,
    ) -> (Winner, f64, bool) {
        let limit = now + ChronoDuration::milliseconds(self.config.max_clock_skew_ms.max(0));
        let clamp = |ts: DateTime<Utc>| if ts > limit { (limit, true) } else { (ts, false) };

        match (local.updated_at(), remote.updated_at()) {
            (Some(l_raw), Some(r_raw)) => {
                let (l, l_clamped) = clamp(l_raw);
                let (r, r_clamped) = clamp(r_raw);
                let clamped = l_clamped || r_clamped;
                // Two clamped timestamps still keep their relative order
                match l.cmp(&r).then_with(|| l_raw.cmp(&r_raw)) {
                    std::cmp::Ordering::Greater => (Winner::Local, 1.0, clamped),
                    std::cmp::Ordering::Less => (Winner::Remote, 1.0, clamped),
                    std::cmp::Ordering::Equal => (Winner::Remote, 0.5, clamped),
                }
            }
            _ => {
                let local_fields = local.populated_field_count();
                let remote_fields = remote.populated_field_count();
                match local_fields.cmp(&remote_fields) {
                    std::cmp::Ordering::Greater => (Winner::Local, 0.25, false),
                    std::cmp::Ordering::Less => (Winner::Remote, 0.25, false),
                    std::cmp::Ordering::Equal => (Winner::Local, 0.0, false),
                }
            }
        }
    }

    fn push_record(&mut self, record: ConflictRecord) {
        self.audit_log.push_back(record);
        while self.audit_log.len() > self.config.audit_log_capacity {
            self.audit_log.pop_front();
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("Failed to save conflict log: {:#}", e);
        }
    }

    /// Write the audit log to its file (no-op for in-memory resolvers)
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.audit_log)?;
        fs::write(path, json).context("Failed to save conflict log")?;
        Ok(())
    }

    // ==================== Reporting ====================

    /// Most recent records, newest first
    pub fn get_audit_log(&self, limit: usize) -> Vec<ConflictRecord> {
        self.audit_log.iter().rev().take(limit).cloned().collect()
    }

    /// Resolution counts
    pub fn get_statistics(&self) -> ResolverStatistics {
        self.statistics
    }

    /// Whether a trusted resolution has been observed without a following error
    pub fn is_ready_for_cross_browser_sync(&self) -> bool {
        self.confirmed || self.pending_trusted
    }

    /// A sync cycle completed after the latest resolutions
    pub fn note_success(&mut self) {
        if self.pending_trusted {
            self.confirmed = true;
            self.pending_trusted = false;
        }
    }

    /// A sync cycle failed right after the latest resolutions
    pub fn note_error(&mut self) {
        self.pending_trusted = false;
    }

    /// Drop all records and counts
    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
        self.statistics = ResolverStatistics::default();
        self.pending_trusted = false;
        self.confirmed = false;
        self.persist();
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}
