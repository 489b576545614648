//! Configuration management.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for networks.
    pub data_dir: PathBuf,
    /// Docker socket path.
    #[serde(default)]
    pub docker_socket: Option<String>,
    /// Interval between "is the node online yet" probes, in milliseconds.
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
    /// Time budget for a node to come online, in milliseconds.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

const fn default_wait_interval_ms() -> u64 {
    3_000
}

const fn default_wait_timeout_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("", "", "regnet")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".regnet"));

        Self::with_data_dir(data_dir)
    }
}

impl Config {
    /// Default configuration rooted at a specific data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            docker_socket: None,
            wait_interval_ms: default_wait_interval_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }

    /// Load configuration from disk or create default.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Directory holding one sub-directory (and one descriptor file) per network.
    pub fn networks_dir(&self) -> PathBuf {
        self.data_dir.join("networks")
    }

    /// Polling interval used when waiting for nodes to come online.
    pub const fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    /// Time budget used when waiting for nodes to come online.
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Get configuration file path.
    fn config_path() -> Result<PathBuf> {
        ProjectDirs::from("", "", "regnet")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .ok_or_else(|| Error::Config("could not determine config directory".into()))
    }
}
