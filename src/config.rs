// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Wraps the dispatcher settings with storage, console, logging and metrics sections

use crate::paths;
use anyhow::{Context, Result};
use parley_core::{DispatcherConfig, StringList};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub console: ConsoleConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep users and channels in memory only
    pub in_memory: bool,
    /// SQLite database file; defaults to the XDG data dir
    pub database: Option<String>,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p)))
            .unwrap_or_else(paths::database_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// The bot's user id on the console platform
    pub self_id: String,
    /// Sender of lines typed at the console
    pub user_id: String,
    /// Channel used for group mode
    pub channel_id: String,
    /// Start in group mode instead of a private chat
    pub group: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            self_id: "parley".to_string(),
            user_id: "operator".to_string(),
            channel_id: "lobby".to_string(),
            group: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub level: String,
    /// Write a daily-rolling log file here as well
    pub dir: Option<String>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on this port
    pub port: Option<u16>,
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(path = %path, "Could not determine home directory to expand path");
    }
    path.to_string()
}

fn split_list(val: &str) -> StringList {
    StringList::Many(
        val.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. PARLEY_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. ~/.config/parley/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("PARLEY_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load the config file if there is one, then apply environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like `load`, but an explicit path wins over the search order
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match path.or_else(Self::find_config_file) {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                let content = std::fs::read_to_string(&config_path)
                    .with_context(|| format!("Failed to read {}", config_path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse {}", config_path.display()))?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PARLEY_PREFIX") {
            self.dispatcher.prefix = split_list(&val);
        }
        if let Ok(val) = std::env::var("PARLEY_NICKNAME") {
            self.dispatcher.nickname = split_list(&val);
        }
        if let Ok(val) = std::env::var("PARLEY_DATABASE") {
            self.storage.database = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_LOG_DIR") {
            self.logging.dir = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_SELF_ID") {
            self.console.self_id = val;
        }
        if let Ok(val) = std::env::var("PARLEY_METRICS_PORT") {
            self.metrics.port = Some(val.parse().with_context(|| {
                format!("PARLEY_METRICS_PORT must be a valid port number, got: {}", val)
            })?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let coefficient = self.dispatcher.similarity_coefficient;
        if !(0.0..=1.0).contains(&coefficient) {
            anyhow::bail!(
                "dispatcher.similarity_coefficient must be between 0 and 1, got {}",
                coefficient
            );
        }
        if self.console.self_id.trim().is_empty() {
            anyhow::bail!("console.self_id is required (set in config.toml or PARLEY_SELF_ID)");
        }
        if self.console.user_id == self.console.self_id {
            anyhow::bail!("console.user_id must differ from console.self_id");
        }
        Ok(())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.logging.dir.as_deref().map(|d| PathBuf::from(expand_tilde(d)))
    }
}
