//! Runtime configuration loaded from `~/.viewsync/sync.toml`.
//!
//! Every section is optional; a missing file yields defaults. A file that
//! exists but fails to parse is reported so misconfiguration is not silent.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".viewsync/sync.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub views: ViewsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Fraction of each delay randomized away; 0 disables jitter.
    pub reconnect_jitter: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_jitter: 0.5,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewsConfig {
    /// Debounce window for view change notifications; 0 notifies immediately.
    pub quiescence_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: 0,
            flush_interval_ms: 25,
        }
    }
}

impl ViewsConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5_000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(SyncError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| SyncError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source: err,
    })?;
    toml::from_str::<SyncConfig>(&content).map_err(|err| SyncError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
