//! Configuration loader and validator for the inspection sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::db::queue::Backoff;

/// Upper bound for either backoff setting: one week.
const MAX_BACKOFF_LIMIT_SECONDS: u64 = 7 * 24 * 3600;
const MAX_ESCALATE_AFTER_ATTEMPTS: u32 = 1000;
use crate::engine::SyncSettings;

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
    pub remote: Remote,
    #[serde(default)]
    pub sync: SyncSection,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Inspection server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Drain pass tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_base_backoff_seconds")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_escalate_after_attempts")]
    pub escalate_after_attempts: u32,
    #[serde(default = "default_start_online")]
    pub start_online: bool,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_concurrency() -> u32 {
    4
}

fn default_base_backoff_seconds() -> u64 {
    5
}

fn default_escalate_after_attempts() -> u32 {
    5
}

fn default_start_online() -> bool {
    true
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            base_backoff_seconds: default_base_backoff_seconds(),
            escalate_after_attempts: default_escalate_after_attempts(),
            start_online: default_start_online(),
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        crate::db::expand_home(&self.data_dir)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` when set, else `survey.db` inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/survey.db", self.app.resolved_data_dir()))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_size: i64::from(self.sync.batch_size),
            max_concurrency: self.sync.max_concurrency as usize,
            backoff: Backoff {
                base_secs: i64::try_from(self.sync.base_backoff_seconds).unwrap_or(i64::MAX),
                max_secs: i64::try_from(self.app.max_backoff_seconds).unwrap_or(i64::MAX),
            },
            request_timeout: Duration::from_millis(self.remote.timeout_ms),
            escalate_after_attempts: i32::try_from(self.sync.escalate_after_attempts)
                .unwrap_or(i32::MAX),
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    let base = cfg.remote.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Invalid("remote.base_url must be an http(s) URL"));
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.timeout_ms must be > 0"));
    }

    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be > 0"));
    }
    if cfg.sync.max_concurrency == 0 {
        return Err(ConfigError::Invalid("sync.max_concurrency must be > 0"));
    }
    if cfg.sync.escalate_after_attempts == 0 {
        return Err(ConfigError::Invalid("sync.escalate_after_attempts must be > 0"));
    }
    if cfg.sync.escalate_after_attempts > MAX_ESCALATE_AFTER_ATTEMPTS {
        return Err(ConfigError::Invalid("sync.escalate_after_attempts must be <= 1000"));
    }
    if cfg.sync.base_backoff_seconds > MAX_BACKOFF_LIMIT_SECONDS {
        return Err(ConfigError::Invalid("sync.base_backoff_seconds must be <= 604800"));
    }
    if cfg.app.max_backoff_seconds > MAX_BACKOFF_LIMIT_SECONDS {
        return Err(ConfigError::Invalid("app.max_backoff_seconds must be <= 604800"));
    }

    Ok(())
}

/// Returns the sample configuration shipped with the crate.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 30000
  max_backoff_seconds: 3600

remote:
  base_url: "https://inspections.example.com/api/v1/"
  token: "YOUR_API_TOKEN"
  timeout_ms: 10000

sync:
  batch_size: 50
  max_concurrency: 4
  base_backoff_seconds: 5
  escalate_after_attempts: 5
  start_online: true
"#
}
