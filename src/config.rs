//! Configuration management for silicore
//!
//! Polling cadence, enabled hardware categories and timing knobs for the
//! bus gateway and clock estimation, persisted as TOML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// silicore configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Polling and timing options
    #[serde(default)]
    pub general: GeneralConfig,
    /// Enabled hardware categories
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Sensor history options
    #[serde(default)]
    pub sensors: SensorConfig,
}

/// Polling and timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Update interval in milliseconds
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    /// How long a decoder waits for the ISA/PCI bus mutex
    #[serde(default = "default_bus_timeout")]
    pub bus_timeout_ms: u64,
    /// Calibration window for timestamp-counter frequency estimation
    #[serde(default = "default_clock_window")]
    pub clock_window_ms: u64,
}

/// Enabled hardware categories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_true")]
    pub cpu: bool,
    #[serde(default = "default_true")]
    pub mainboard: bool,
    #[serde(default = "default_true")]
    pub gpu: bool,
    #[serde(default = "default_true")]
    pub storage: bool,
    #[serde(default = "default_true")]
    pub memory: bool,
}

/// Sensor history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// History retention window in seconds (0 disables history)
    #[serde(default = "default_history_window")]
    pub history_window_secs: u64,
}

// Default value functions
fn default_update_interval() -> u64 {
    1000 // 1 second
}

fn default_bus_timeout() -> u64 {
    10
}

fn default_clock_window() -> u64 {
    25
}

fn default_true() -> bool {
    true
}

fn default_history_window() -> u64 {
    24 * 60 * 60 // 24 hours
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval(),
            bus_timeout_ms: default_bus_timeout(),
            clock_window_ms: default_clock_window(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            cpu: true,
            mainboard: true,
            gpu: true,
            storage: true,
            memory: true,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            history_window_secs: default_history_window(),
        }
    }
}

impl Config {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.general.update_interval_ms)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.general.bus_timeout_ms)
    }

    pub fn clock_window(&self) -> Duration {
        Duration::from_millis(self.general.clock_window_ms)
    }

    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sensors.history_window_secs as i64)
    }

    /// Get the default configuration directory
    ///
    /// Returns `~/.config/silicore` on Unix-like systems,
    /// or `%APPDATA%\silicore` on Windows.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = if cfg!(windows) {
            std::env::var("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        } else {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from(".config"))
        };

        Ok(config_dir.join("silicore"))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_file = Self::default_path()?.join("config.toml");

        if !config_file.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_file)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::default_path()?;
        std::fs::create_dir_all(&config_dir)?;
        self.save_to(&config_dir.join("config.toml"))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.update_interval_ms, 1000);
        assert_eq!(config.bus_timeout(), Duration::from_millis(10));
        assert_eq!(config.clock_window(), Duration::from_millis(25));
        assert_eq!(config.history_window(), chrono::Duration::hours(24));
        assert!(config.hardware.cpu && config.hardware.storage);
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [hardware]
            gpu = false

            [general]
            update_interval_ms = 250
            "#,
        )
        .unwrap();
        assert!(!config.hardware.gpu);
        assert!(config.hardware.mainboard);
        assert_eq!(config.update_interval(), Duration::from_millis(250));
        assert_eq!(config.general.bus_timeout_ms, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.sensors.history_window_secs = 600;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sensors.history_window_secs, 600);
    }
}
