//! tasksync CLI
//!
//! Command-line interface for tasksync - local task documents with
//! progressive CouchDB replication.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tasksync_core::{Config, LocalStore, MemoryRemote, SyncEngine};

mod commands;
mod logging;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "tasksync - Local-first tasks with progressive sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Replicate with an in-process remote instead of remote.url
    #[arg(long, global = true)]
    memory_remote: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show local store, health and sync mode
    Status,
    /// Run progressive sync once and report the outcome
    Sync,
    /// Enable sync and print change notifications until Ctrl-C
    Watch,
    /// Create or update a document
    Put {
        /// Document id (e.g. task-42)
        id: String,
        /// Fields as key=value; values are parsed as JSON when possible
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Show a document
    Get {
        /// Document id
        id: String,
    },
    /// Delete a document
    #[command(alias = "rm")]
    Delete {
        /// Document id
        id: String,
    },
    /// Show the conflict audit log
    Conflicts {
        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Clear the audit log and breaker counters instead
        #[arg(long)]
        reset: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote.url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands don't need the engine
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    logging::init(&config);

    let engine = open_engine(&mut config, cli.memory_remote)?;

    match cli.command {
        Commands::Status => commands::status::show(&engine, &output),
        Commands::Sync => commands::sync::sync(&engine, &output).await,
        Commands::Watch => commands::sync::watch(&engine, &output).await,
        Commands::Put { id, fields } => commands::doc::put(&engine, id, fields, &output),
        Commands::Get { id } => commands::doc::get(&engine, id, &output),
        Commands::Delete { id } => commands::doc::delete(&engine, id, &output),
        Commands::Conflicts { limit, reset } => {
            commands::conflicts::show(&engine, limit, reset, &output)
        }
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Build the engine over the on-disk store
fn open_engine(config: &mut Config, memory_remote: bool) -> Result<SyncEngine> {
    if !memory_remote {
        return SyncEngine::open(config.clone()).context("Failed to open sync engine");
    }

    config.remote.url = Some("memory://tasks".to_string());
    let store = LocalStore::open(&config.store_path())
        .with_context(|| format!("Failed to open store at {:?}", config.store_path()))?;
    let remote = MemoryRemote::new();
    commands::sync::seed_demo_remote(&remote, &store)?;
    Ok(SyncEngine::new(config.clone(), store, Some(Arc::new(remote))))
}
