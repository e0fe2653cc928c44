//! Configuration loader and validator for the quote collection and its sync loop.
use crate::model::ConflictMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sync: SyncSettings,
    pub remote: Remote,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sync_interval_ms: u64,
}

/// Sync cycle policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default)]
    pub conflict_mode: ConflictMode,
    /// Skip a tick while a previous cycle is still running.
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,
    /// Failed deliveries before an outbox entry is abandoned. 0 retries forever.
    #[serde(default)]
    pub max_attempts: u32,
    /// Cap for exponential retry backoff. 0 retries on every cycle.
    #[serde(default)]
    pub max_backoff_seconds: u64,
}

/// Mock remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub posts_path: String,
    pub fetch_limit: usize,
    pub timeout_ms: u64,
}

fn default_single_flight() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/quotes.db", self.app.resolved_data_dir()))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.app.sync_interval_ms)
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Remote {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate YAML configuration text.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_ms must be > 0"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.remote.base_url).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be an absolute URL"));
    }
    if cfg.remote.posts_path.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.posts_path must be non-empty"));
    }
    if cfg.remote.fetch_limit == 0 {
        return Err(ConfigError::Invalid("remote.fetch_limit must be > 0"));
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.timeout_ms must be > 0"));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_ms: 30000

sync:
  conflict_mode: auto
  single_flight: true
  max_attempts: 0
  max_backoff_seconds: 0

remote:
  base_url: "https://jsonplaceholder.typicode.com/"
  posts_path: "posts"
  fetch_limit: 10
  timeout_ms: 10000
"#
}
