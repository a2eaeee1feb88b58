//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gift_sync_core::SyncConfig;
use serde::{Deserialize, Serialize};

/// Main configuration for the sync daemon, read from `<data-dir>/config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Account whose data is synced (overridden by `--user`)
    #[serde(default)]
    pub user_id: Option<String>,

    /// Remote document store
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Seconds between sync cycles while they succeed (default: 60)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Delay growth after failed cycles
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Sync policy
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Set to false to keep working offline even when the remote is reachable
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the document API, e.g. "https://gifts.example.com/api"
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_token: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed cycle (default: 5)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Upper bound on the delay (default: 15 minutes)
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Multiplier per consecutive failure (default: 2.0)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl BackoffConfig {
    /// Reject settings that would make the retry delay shrink or go negative
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            bail!(
                "backoff.backoff_factor must be a finite number of at least 1.0, got {}",
                self.backoff_factor
            );
        }
        if self.initial_delay_secs > self.max_delay_secs {
            bail!(
                "backoff.initial_delay_secs ({}) exceeds backoff.max_delay_secs ({})",
                self.initial_delay_secs,
                self.max_delay_secs
            );
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

fn default_initial_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    15 * 60
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            remote: RemoteConfig::default(),
            sync_interval_secs: default_sync_interval(),
            backoff: BackoffConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the data directory, writing defaults if absent
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: DaemonConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            config
                .validate()
                .with_context(|| format!("Invalid settings in {:?}", config_file))?;
            tracing::debug!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = DaemonConfig::default();

            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            bail!("sync_interval_secs must be at least 1");
        }
        self.backoff.validate()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
