//! Configuration module
//!
//! Handles the TOML application configuration

mod settings;

pub use settings::{AppConfig, BusConfig, DeviceConfig, LoggingConfig, TimingConfig};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No per-user configuration directory on this platform
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for [`AppConfig`]
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialising the configuration failed
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "cctalk", "cctalk")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}
