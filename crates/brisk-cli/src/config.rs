use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use brisk_sync::{RetryBackoff, WorkerSettings};
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/brisk/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the directory holding the encrypted snapshot.
    pub data_dir: Option<PathBuf>,
    /// Poll interval applied to the store on every start.
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub batch_limit: Option<usize>,
    pub mutation_timeout_ms: Option<u64>,
    pub drain_interval_ms: Option<u64>,
    /// `false` leaves failed changes for `brisk queue retry`.
    pub auto_retry: Option<bool>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
}

impl Config {
    /// Worker settings with unset fields left at their defaults.
    pub fn worker_settings(&self) -> WorkerSettings {
        let defaults = WorkerSettings::default();
        WorkerSettings {
            batch_limit: self.sync.batch_limit.unwrap_or(defaults.batch_limit),
            mutation_timeout: self
                .sync
                .mutation_timeout_ms
                .map_or(defaults.mutation_timeout, Duration::from_millis),
            drain_interval: self
                .sync
                .drain_interval_ms
                .map_or(defaults.drain_interval, Duration::from_millis),
            retry: self.retry_backoff(),
        }
    }

    fn retry_backoff(&self) -> Option<RetryBackoff> {
        if self.sync.auto_retry == Some(false) {
            return None;
        }
        let defaults = RetryBackoff::default();
        Some(RetryBackoff {
            base: self
                .sync
                .retry_base_ms
                .map_or(defaults.base, Duration::from_millis),
            max: self
                .sync
                .retry_max_ms
                .map_or(defaults.max, Duration::from_millis),
        })
    }

    /// Starter file written by `brisk config init`.
    pub fn starter() -> Self {
        let defaults = WorkerSettings::default();
        let backoff = RetryBackoff::default();
        Self {
            data_dir: None,
            poll_interval_ms: Some(brisk_task::DEFAULT_POLL_INTERVAL_MS),
            sync: SyncConfig {
                batch_limit: Some(defaults.batch_limit),
                mutation_timeout_ms: u64::try_from(defaults.mutation_timeout.as_millis()).ok(),
                drain_interval_ms: u64::try_from(defaults.drain_interval.as_millis()).ok(),
                auto_retry: Some(true),
                retry_base_ms: u64::try_from(backoff.base.as_millis()).ok(),
                retry_max_ms: u64::try_from(backoff.max.as_millis()).ok(),
            },
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("brisk").join("config.toml"))
}

/// Write `config` to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
