//! Conflicts command handler

use anyhow::Result;

use tasksync_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Show (or clear) the conflict audit log
pub fn show(engine: &SyncEngine, limit: usize, reset: bool, output: &Output) -> Result<()> {
    if reset {
        engine.reset_sync_state();
        output.success("Conflict log and breaker counters cleared");
        return Ok(());
    }

    let view = engine.view();
    let records = view.conflict_log(limit);
    output.print_conflicts(&records);

    if output.format == OutputFormat::Human && !records.is_empty() {
        let stats = view.conflict_statistics();
        println!(
            "Confidence: {} high, {} medium, {} low",
            stats.high_confidence, stats.medium_confidence, stats.low_confidence
        );
    }
    Ok(())
}
