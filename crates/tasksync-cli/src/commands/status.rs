//! Status command handler

use anyhow::Result;

use tasksync_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Show status information
///
/// Reads state without starting replication; run `sync` to exercise the remote.
pub fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let config = engine.config();
    let view = engine.view();
    let status = view.progressive_status();
    let doc_count = engine.store().doc_count()?;
    let conflicts = view.conflict_statistics();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "store": config.store_path(),
                    "documents": doc_count,
                    "sync_enabled": config.sync_enabled,
                    "remote": config.remote.url,
                    "sync": status,
                    "conflicts": conflicts,
                    "errors": view.error_log()
                })
            );
        }
        OutputFormat::Quiet => output.print_status(&status),
        OutputFormat::Human => {
            println!("tasksync Status");
            println!("===============");
            println!();
            println!("Storage:");
            println!("  Location:  {}", config.store_path().display());
            println!("  Documents: {}", doc_count);
            println!();
            println!("Remote:");
            println!(
                "  URL:     {}",
                config.remote.url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  Enabled: {}",
                if config.sync_enabled { "yes" } else { "no" }
            );
            println!();
            output.print_status(&status);
            println!();
            println!(
                "Conflicts: {} resolved ({} local, {} remote)",
                conflicts.total, conflicts.local_wins, conflicts.remote_wins
            );
            output.print_errors(&view.error_log());
        }
    }

    Ok(())
}
