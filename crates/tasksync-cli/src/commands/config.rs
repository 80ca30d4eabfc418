//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tasksync_core::{Config, ConflictStrategy};

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, sync_enabled, log_level, log_file, remote.url, \
                          remote.username, remote.password, remote.live, resolver.strategy";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    if config.remote.password.is_some() {
        config.remote.password = Some("********".to_string());
    }

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!("  sync_enabled:      {}", config.sync_enabled);
            println!("  log_level:         {}", config.log_level);
            println!(
                "  log_file:          {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!(
                "  remote.url:        {}",
                config.remote.url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  remote.username:   {}",
                config.remote.username.as_deref().unwrap_or("(not set)")
            );
            println!("  remote.live:       {}", config.remote.live);
            println!("  resolver.strategy: {}", config.resolver.strategy);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "remote.password" { "********" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "log_level" => config.log_level = value.to_string(),
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        "remote.url" => config.remote.url = optional(value),
        "remote.username" => config.remote.username = optional(value),
        "remote.password" => config.remote.password = optional(value),
        "remote.live" => {
            config.remote.live = value
                .parse()
                .context("Invalid value for remote.live. Use 'true' or 'false'.")?;
        }
        "resolver.strategy" => {
            config.resolver.strategy = value.parse::<ConflictStrategy>()?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "remote.url", "http://localhost:5984/tasks").unwrap();
        apply(&mut config, "sync_enabled", "true").unwrap();
        apply(&mut config, "resolver.strategy", "remote-wins").unwrap();

        assert_eq!(
            config.remote.url.as_deref(),
            Some("http://localhost:5984/tasks")
        );
        assert!(config.sync_enabled);
        assert_eq!(config.resolver.strategy, ConflictStrategy::RemoteWins);

        apply(&mut config, "remote.url", "none").unwrap();
        assert!(config.remote.url.is_none());
    }

    #[test]
    fn test_set_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!("data_dir = {:?}\n", dir.path().join("data")),
        )
        .unwrap();

        let output = Output::new(OutputFormat::Quiet);
        set(
            "resolver.strategy".to_string(),
            "local-wins".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.resolver.strategy, ConflictStrategy::LocalWins);
        assert_eq!(config.data_dir, dir.path().join("data"));
    }

    #[test]
    fn test_apply_rejects_bad_input() {
        let mut config = Config::default();
        assert!(apply(&mut config, "sync_enabled", "maybe").is_err());
        assert!(apply(&mut config, "resolver.strategy", "coin-flip").is_err());
        assert!(apply(&mut config, "favorite_color", "blue").is_err());
    }
}
