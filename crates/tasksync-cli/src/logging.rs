//! Tracing setup

use std::fs::OpenOptions;

use tracing_subscriber::EnvFilter;

use tasksync_core::Config;

/// Install the global subscriber
///
/// Logs go to `log_file` when configured, otherwise to stderr. `RUST_LOG`
/// takes precedence over `log_level`.
pub fn init(config: &Config) {
    let log_level = &config.log_level;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tasksync_core={},tasksync_cli={}",
            log_level, log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore errors if a subscriber is already installed
    match &config.log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(file).try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
