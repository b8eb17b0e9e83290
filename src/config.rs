//! Configuration file parser for ~/.config/refeed/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they are
//! usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::cleanup::DEFAULT_MAX_ARTICLE_AGE_DAYS;
use crate::tasks::{TaskOptions, DEFAULT_POOL_CAPACITY};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The proxy URL can carry credentials, so `Debug` redacts it.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minutes between global refreshes. 0 = refresh once at startup only.
    pub refresh_interval_minutes: u64,

    /// Refresh pool capacity, clamped to 1..=30 by the task manager.
    pub max_concurrent_refreshes: usize,

    /// Entries kept per content cache map.
    pub cache_capacity: usize,

    pub cache_ttl_minutes: u64,

    /// Default retention for the cleanup pass. The `max_article_age_days`
    /// setting in the database takes precedence. 0 disables cleanup.
    pub max_article_age_days: u32,

    pub user_agent: String,

    /// Proxy for every feed without its own override.
    pub proxy_url: Option<String>,

    /// Directory custom fetch scripts are resolved against. Scripts are
    /// disabled when unset.
    pub scripts_dir: Option<PathBuf>,

    /// Task transition log, truncated at startup.
    pub task_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: 30,
            max_concurrent_refreshes: DEFAULT_POOL_CAPACITY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl_minutes: DEFAULT_CACHE_TTL.as_secs() / 60,
            max_article_age_days: DEFAULT_MAX_ARTICLE_AGE_DAYS,
            user_agent: concat!("refeed/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy_url: None,
            scripts_dir: None,
            task_log: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("refresh_interval_minutes", &self.refresh_interval_minutes)
            .field("max_concurrent_refreshes", &self.max_concurrent_refreshes)
            .field("cache_capacity", &self.cache_capacity)
            .field("cache_ttl_minutes", &self.cache_ttl_minutes)
            .field("max_article_age_days", &self.max_article_age_days)
            .field("user_agent", &self.user_agent)
            .field("proxy_url", &self.proxy_url.as_ref().map(|_| "[REDACTED]"))
            .field("scripts_dir", &self.scripts_dir)
            .field("task_log", &self.task_log)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 9] = [
    "refresh_interval_minutes",
    "max_concurrent_refreshes",
    "cache_capacity",
    "cache_ttl_minutes",
    "max_article_age_days",
    "user_agent",
    "proxy_url",
    "scripts_dir",
    "task_log",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            interval = config.refresh_interval_minutes,
            concurrency = config.max_concurrent_refreshes,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes.saturating_mul(60))
    }

    /// Interval between global refreshes, `None` when periodic refresh is off.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_minutes > 0)
            .then(|| Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60)))
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            capacity: self.max_concurrent_refreshes,
            op_log: self.task_log.clone(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
