//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/jeefhs/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/jeefhs/` (~/.config/jeefhs/)
//! - Data: `$XDG_DATA_HOME/jeefhs/` (~/.local/share/jeefhs/)
//! - State/Logs: `$XDG_STATE_HOME/jeefhs/` (~/.local/state/jeefhs/)
//!
//! Cloud secrets can be supplied through the environment instead of the file:
//! `JEEFHS_CLOUD_ENDPOINT` and `JEEFHS_CLOUD_API_KEY` override `[cloud]`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var overriding `cloud.endpoint`
pub const ENV_CLOUD_ENDPOINT: &str = "JEEFHS_CLOUD_ENDPOINT";
/// Env var overriding `cloud.api_key`
pub const ENV_CLOUD_API_KEY: &str = "JEEFHS_CLOUD_API_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Identity of this edge device
    #[serde(default)]
    pub device: DeviceConfig,

    /// Replication policy
    #[serde(default)]
    pub sync: SyncConfig,

    /// Cloud endpoint
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Sensors, actuators and collection intervals
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Identifier for this device in the cloud store
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Override path for the local event database
    pub database_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            database_path: None,
        }
    }
}

fn default_device_id() -> String {
    "pi_01".to_string()
}

/// Replication policy consumed by the sync daemon and compaction.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between sync cycles while idle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum records per cloud write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// First retry delay after a failed write
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Seconds before an in-flight batch write is abandoned as failed
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Synced rows older than this many hours may be purged locally
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Seconds between compaction passes in the agent
    #[serde(default = "default_compact_interval")]
    pub compact_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            write_timeout_secs: default_write_timeout(),
            retention_hours: default_retention_hours(),
            compact_interval_secs: default_compact_interval(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn retention_horizon(&self) -> Duration {
        hours(self.retention_hours)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err(Error::Config(
                "sync.batch_size must be between 1 and 500".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::Config(
                "sync.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.write_timeout_secs == 0 {
            return Err(Error::Config(
                "sync.write_timeout_secs must be positive".to_string(),
            ));
        }
        if self.backoff_base_secs == 0 {
            return Err(Error::Config(
                "sync.backoff_base_secs must be positive".to_string(),
            ));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(Error::Config(
                "sync.backoff_cap_secs must not be smaller than sync.backoff_base_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// `n` hours, saturating at `u64::MAX` seconds
pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

fn default_poll_interval() -> u64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    300
}

fn default_write_timeout() -> u64 {
    15
}

fn default_retention_hours() -> u64 {
    24 * 7
}

fn default_compact_interval() -> u64 {
    3600
}

/// How the daemon checks whether the cloud is reachable
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// `GET <endpoint>/health`
    #[default]
    Http,
    /// TCP connect to the endpoint's host and port
    Tcp,
}

/// Cloud store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CloudConfig {
    /// Base URL of the ingest API (e.g., `https://cloud.example.com/api`)
    pub endpoint: Option<String>,

    /// Bearer token for the ingest API
    pub api_key: Option<String>,

    /// Reachability check strategy
    #[serde(default)]
    pub probe: ProbeKind,

    /// Reachability check timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            probe: ProbeKind::default(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    2000
}

impl CloudConfig {
    /// Check if the cloud endpoint is configured
    pub fn is_ready(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "cloud.endpoint must be an http(s) URL, got '{}'",
                    endpoint
                )));
            }
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "cloud.probe_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var(ENV_CLOUD_ENDPOINT) {
            if !endpoint.is_empty() {
                self.endpoint = Some(endpoint);
            }
        }
        if let Ok(key) = std::env::var(ENV_CLOUD_API_KEY) {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
    }
}

/// Which sensor/actuator implementation to use
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// In-memory actuators and synthetic readings
    #[default]
    Simulated,
    /// Linux sysfs GPIO and IIO devices
    Sysfs,
}

/// Sensor, actuator and collection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DevicesConfig {
    /// Implementation to construct at startup
    #[serde(default)]
    pub backend: DeviceBackend,

    /// Seconds between environmental readings
    #[serde(default = "default_env_interval")]
    pub env_interval_secs: u64,

    /// Seconds between motion sensor checks
    #[serde(default = "default_motion_interval")]
    pub motion_interval_secs: u64,

    /// Seconds between heartbeat events (0 disables)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// IIO device directory exposing `in_temp_input` and `in_humidityrelative_input`
    #[serde(default = "default_iio_dir")]
    pub iio_dir: PathBuf,

    /// Root of the sysfs GPIO tree
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    /// GPIO numbers by device name (pir, red_led, green_led, blue_led, fan, buzzer)
    #[serde(default)]
    pub pins: std::collections::BTreeMap<String, u32>,

    /// How long the buzzer sounds per pulse, in milliseconds
    #[serde(default = "default_buzzer_pulse")]
    pub buzzer_pulse_ms: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::default(),
            env_interval_secs: default_env_interval(),
            motion_interval_secs: default_motion_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            iio_dir: default_iio_dir(),
            gpio_root: default_gpio_root(),
            pins: Default::default(),
            buzzer_pulse_ms: default_buzzer_pulse(),
        }
    }
}

fn default_env_interval() -> u64 {
    60
}

fn default_motion_interval() -> u64 {
    1
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_iio_dir() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0")
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_buzzer_pulse() -> u64 {
    500
}

impl DevicesConfig {
    /// Look up the GPIO number for a named device
    pub fn pin(&self, name: &str) -> Result<u32> {
        self.pins
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("devices.pins.{} is not set", name)))
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            let mut config = Config::default();
            config.cloud.apply_env_overrides();
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.cloud.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(Error::Config("device.id must not be empty".to_string()));
        }
        self.sync.validate()?;
        self.cloud.validate()?;
        Ok(())
    }

    /// Returns the local event database for this configuration
    pub fn store_path(&self) -> PathBuf {
        self.device
            .database_path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/jeefhs/config.toml` (~/.config/jeefhs/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("jeefhs").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/jeefhs/` (~/.local/share/jeefhs/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("jeefhs")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/jeefhs/` (~/.local/state/jeefhs/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("jeefhs")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/jeefhs/events.db` (~/.local/share/jeefhs/events.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("events.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/jeefhs/jeefhs.log` (~/.local/state/jeefhs/jeefhs.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("jeefhs.log")
    }
}
