//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use tasksync_core::{
    ChangeNotification, ConflictRecord, Document, ProgressiveSyncStatus, SyncErrorEvent,
};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print a single document
    pub fn print_document(&self, doc: &Document) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", doc.id);
                println!("Revision: {}", doc.rev.as_deref().unwrap_or("(none)"));
                if doc.deleted {
                    println!("Deleted:  yes");
                }
                if !doc.body.is_empty() {
                    println!();
                    for (key, value) in &doc.body {
                        println!("  {:<12} {}", key, display_value(value));
                    }
                }
            }
            OutputFormat::Json => self.json(doc),
            OutputFormat::Quiet => {
                println!("{}", doc.rev.as_deref().unwrap_or_default());
            }
        }
    }

    /// Print a progressive sync status snapshot
    pub fn print_status(&self, status: &ProgressiveSyncStatus) {
        match self.format {
            OutputFormat::Human => {
                println!("Sync:");
                println!("  Mode:     {}", status.mode);
                println!("  Status:   {}", status.status);
                println!("  Online:   {}", if status.online { "yes" } else { "no" });
                println!(
                    "  Ready:    {}",
                    if status.is_progressive_sync_ready {
                        "yes"
                    } else {
                        "no"
                    }
                );
                if let Some(ref reason) = status.reason {
                    println!("  Reason:   {}", reason);
                }
                if let Some(at) = status.promoted_at {
                    println!("  Promoted: {}", at.format("%Y-%m-%d %H:%M:%S"));
                }
                println!(
                    "  Handles:  {} live, {} pull",
                    status.handles.bidirectional, status.handles.one_directional
                );
                println!();
                println!("Health:");
                println!(
                    "  Score:         {} ({})",
                    status.health.score, status.health.overall_band
                );
                println!("  Conflict rate: {:.1}%", status.conflict_rate);
                println!(
                    "  Can sync:      {}",
                    if status.can_sync { "yes" } else { "no" }
                );
                for rec in &status.health.recommendations {
                    println!("  - {}", rec);
                }
            }
            OutputFormat::Json => self.json(status),
            OutputFormat::Quiet => println!("{}", status.mode),
        }
    }

    /// Print caught replication errors
    pub fn print_errors(&self, errors: &[SyncErrorEvent]) {
        if errors.is_empty() || self.format != OutputFormat::Human {
            return;
        }
        println!();
        println!("── Errors ({}) ──", errors.len());
        for e in errors {
            println!(
                "[{}] {} ({}): {}",
                e.timestamp.format("%H:%M:%S"),
                e.context,
                e.category,
                truncate(&e.message, 70)
            );
        }
    }

    /// Print conflict audit records, newest first
    pub fn print_conflicts(&self, records: &[ConflictRecord]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No conflicts recorded.");
                    return;
                }
                for r in records {
                    println!(
                        "{} | {} | {} wins ({:.2}) | {}",
                        r.timestamp.format("%Y-%m-%d %H:%M"),
                        truncate(&r.document_id, 24),
                        r.winner,
                        r.confidence,
                        r.resolution_strategy
                    );
                }
                println!("\n{} conflict(s)", records.len());
            }
            OutputFormat::Json => self.json(records),
            OutputFormat::Quiet => {
                for r in records {
                    println!("{}", r.document_id);
                }
            }
        }
    }

    /// Print one live change notification
    pub fn print_change(&self, change: &ChangeNotification) {
        match self.format {
            OutputFormat::Human => {
                let title = change
                    .document
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                println!(
                    "[{}] {:<9} {:<7} {} {}",
                    change.timestamp.format("%H:%M:%S"),
                    format!("{:?}", change.source).to_lowercase(),
                    format!("{:?}", change.change_type).to_lowercase(),
                    change.document_id,
                    truncate(title, 40)
                );
            }
            OutputFormat::Json => match serde_json::to_string(change) {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Failed to serialize change: {}", e),
            },
            OutputFormat::Quiet => println!("{}", change.document_id),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ääääääääääää", 5), "ää...");
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&serde_json::json!("plain")), "plain");
        assert_eq!(display_value(&serde_json::json!(3)), "3");
        assert_eq!(display_value(&serde_json::json!(["a"])), "[\"a\"]");
    }
}
