//! Sync engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tasksync/config.toml)
//! 3. Environment variables (TASKSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resolver::ConflictStrategy;

/// Environment variable prefix
const ENV_PREFIX: &str = "TASKSYNC";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the local document store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Start progressive sync automatically on `init()`
    #[serde(default)]
    pub sync_enabled: bool,

    /// Log level for the CLI subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub propagation: PropagationConfig,

    #[serde(default)]
    pub progressive: ProgressiveConfig,
}

/// Remote database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Database URL, e.g. `http://localhost:5984/tasks`
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep a live bidirectional handle once write-enabled
    pub live: bool,
    /// Retry live cycles after errors instead of stopping the handle
    pub retry: bool,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Documents per changes batch
    pub batch_size: usize,
    /// Maximum batches per pull
    pub batch_limit: usize,
    /// Live handle poll interval when no local writes arrive
    pub poll_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            live: true,
            retry: true,
            timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            batch_size: 100,
            batch_limit: 10,
            poll_interval_ms: 5_000,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_consecutive_errors: u32,
    /// Base cooldown after a trip; doubles on immediate re-trips
    pub cooldown_ms: u64,
    /// Ceiling for the doubled cooldown
    pub max_cooldown_ms: u64,
    pub max_sync_duration_ms: u64,
    /// Number of recent outcomes kept for the health score
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            cooldown_ms: 300,
            max_cooldown_ms: 30_000,
            max_sync_duration_ms: 30_000,
            window_size: 20,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn max_sync_duration(&self) -> Duration {
        Duration::from_millis(self.max_sync_duration_ms)
    }
}

/// Conflict resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub strategy: ConflictStrategy,
    pub audit_log_capacity: usize,
    /// Timestamps further than this in the future are clamped to now
    pub max_clock_skew_ms: i64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::LastWriteWins,
            audit_log_capacity: 100,
            max_clock_skew_ms: 300_000,
        }
    }
}

/// Change feed and notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Window in which an identical (id, rev) change is suppressed
    pub debounce_ms: u64,
    /// How long an emitted change counts as pending
    pub settle_delay_ms: u64,
    /// Poll interval for writes made by other processes
    pub feed_poll_interval_ms: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            settle_delay_ms: 500,
            feed_poll_interval_ms: 250,
        }
    }
}

impl PropagationConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms)
    }
}

/// Progressive enablement thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressiveConfig {
    pub min_health_score: u8,
    /// Conflict rate ceiling (percent) for read-only -> write-enabled
    pub max_conflict_rate: f64,
    pub settle_window_ms: u64,
    /// Consecutive auth failures before falling back to disabled
    pub max_auth_failures: u32,
    pub error_log_capacity: usize,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            min_health_score: 50,
            max_conflict_rate: 5.0,
            settle_window_ms: 2_000,
            max_auth_failures: 3,
            error_log_capacity: 50,
        }
    }
}

impl ProgressiveConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_enabled: false,
            log_level: default_log_level(),
            log_file: None,
            remote: RemoteConfig::default(),
            breaker: BreakerConfig::default(),
            resolver: ResolverConfig::default(),
            propagation: PropagationConfig::default(),
            progressive: ProgressiveConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TASKSYNC_DATA_DIR, TASKSYNC_REMOTE_URL, ...)
    /// 2. Config file (~/.config/tasksync/config.toml or TASKSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path when given
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote.url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_USERNAME", ENV_PREFIX)) {
            self.remote.username = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_PASSWORD", ENV_PREFIX)) {
            self.remote.password = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TASKSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tasksync")
            .join("config.toml")
    }

    /// Get the path to the SQLite document store
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("tasksync.db")
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksync")
}

fn default_log_level() -> String {
    "info".to_string()
}
