//! Application settings

use super::ConfigError;
use crate::core::device::md100::{Md100Options, DEFAULT_COUNTRY};
use crate::core::transport::{SerialConfig, DEFAULT_MASTER_ADDRESS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default address of the MD-100 on the bus
pub const DEFAULT_DEVICE_ADDRESS: u8 = 40;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial line settings
    pub serial: SerialConfig,
    /// Bus addressing
    pub bus: BusConfig,
    /// Timeouts and intervals
    pub timing: TimingConfig,
    /// Device options
    pub device: DeviceConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(super::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Load config from the default location, or defaults when there is none
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.save_to(&path)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values the serial line and the device cannot take
    pub fn validate(&self) -> Result<(), ConfigError> {
        let country = &self.device.country;
        if country.len() > 2 || !country.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "device.country '{country}' must be at most 2 ASCII characters"
            )));
        }
        if self.bus.master_address == self.bus.device_address {
            return Err(ConfigError::Invalid(format!(
                "bus.master_address and bus.device_address are both {}",
                self.bus.master_address
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must not be 0".into()));
        }
        Ok(())
    }

    /// Options for the MD-100 device
    pub fn md100_options(&self) -> Md100Options {
        Md100Options {
            country: self.device.country.clone(),
            poll_interval: self.timing.poll_interval(),
        }
    }
}

/// Bus addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address of this master
    pub master_address: u8,
    /// Address of the device
    pub device_address: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            master_address: DEFAULT_MASTER_ADDRESS,
            device_address: DEFAULT_DEVICE_ADDRESS,
        }
    }
}

/// Timeouts and intervals, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Per-command (and per-byte) timeout
    pub command_timeout_ms: u64,
    /// Pause between two polls
    pub poll_interval_ms: u64,
    /// Delay after opening the port
    pub settle_delay_ms: u64,
    /// Macro operation timeout, 0 disables it
    pub operation_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1000,
            poll_interval_ms: 200,
            settle_delay_ms: 1000,
            operation_timeout_ms: 60_000,
        }
    }
}

impl TimingConfig {
    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Pause between two polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay after opening the port
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Macro operation timeout
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }
}

/// Device options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Country code for scaling factor and currency revision queries
    pub country: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            country: DEFAULT_COUNTRY.to_string(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter used when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
    /// Write a daily rotated log file into this directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}
