//! Daemon configuration, loaded from a TOML file.
//!
//! ```toml
//! [control]
//! tick_interval_ms = 5000
//! io_timeout_ms = 2000
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! settings_path = "settings.json"
//!
//! [relays]
//! heater1_pin = 4
//! heater2_pin = 17
//! humidifier_pin = 18
//!
//! [simulator]
//! enabled = true
//! ```
//!
//! Every section and field is optional; missing values take the defaults
//! shown above.

use crate::relay::RelayId;
use crate::settings::MIN_SENSOR_TIMEOUT_S;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "incubator.toml";
pub const MIN_TICK_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub control: ControlConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub relays: RelayConfig,
    pub sensor: SensorConfig,
    pub logging: LoggingConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_ms: u64,
    /// Deadline for every sensor and relay call.
    pub io_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            io_timeout_ms: 2000,
        }
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub settings_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.json"),
        }
    }
}

/// BCM pin numbers of the relay bank inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub heater1_pin: u8,
    pub heater2_pin: u8,
    pub humidifier_pin: u8,
    /// Relay boards of this kind switch on when the input is pulled low.
    pub active_low: bool,
    pub gpio_root: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heater1_pin: 4,
            heater2_pin: 17,
            humidifier_pin: 18,
            active_low: true,
            gpio_root: PathBuf::from("/sys/class/gpio"),
        }
    }
}

impl RelayConfig {
    pub fn pin(&self, relay: RelayId) -> u8 {
        match relay {
            RelayId::Heater1 => self.heater1_pin,
            RelayId::Heater2 => self.heater2_pin,
            RelayId::Humidifier => self.humidifier_pin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// hwmon directory of the SHT3x kernel driver.
    pub hwmon_path: PathBuf,
    /// Optional hwmon directory of an independent over-temperature sensor.
    pub secondary_hwmon_path: Option<PathBuf>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            hwmon_path: PathBuf::from("/sys/class/hwmon/hwmon0"),
            secondary_hwmon_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub enabled: bool,
    pub ambient_f: f32,
    pub ambient_humidity_pct: f32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ambient_f: 72.0,
            ambient_humidity_pct: 40.0,
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    /// A file that exists but does not parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_io_timeout_ms = u64::from(MIN_SENSOR_TIMEOUT_S) * 1000;
        if self.control.io_timeout_ms == 0 || self.control.io_timeout_ms >= max_io_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "io_timeout_ms must be between 1 and {} (got {})",
                max_io_timeout_ms - 1,
                self.control.io_timeout_ms
            )));
        }
        if self.control.tick_interval_ms < MIN_TICK_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "tick_interval_ms must be at least {} (got {})",
                MIN_TICK_INTERVAL_MS, self.control.tick_interval_ms
            )));
        }

        let pins = [
            self.relays.heater1_pin,
            self.relays.heater2_pin,
            self.relays.humidifier_pin,
        ];
        if pins[0] == pins[1] || pins[0] == pins[2] || pins[1] == pins[2] {
            return Err(ConfigError::Invalid(format!(
                "relay pins must be distinct (got {:?})",
                pins
            )));
        }

        if !self.simulator.ambient_f.is_finite()
            || !(0.0..=100.0).contains(&self.simulator.ambient_humidity_pct)
        {
            return Err(ConfigError::Invalid("simulator ambient values out of range".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.control.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.relays.pin(RelayId::Heater2), 17);
    }

    #[test]
    fn test_partial_sections() {
        let config = DaemonConfig::from_toml(
            r#"
            [control]
            tick_interval_ms = 1000

            [relays]
            humidifier_pin = 27
            "#,
        )
        .unwrap();
        assert_eq!(config.control.tick_interval_ms, 1000);
        assert_eq!(config.control.io_timeout_ms, 2000);
        assert_eq!(config.relays.humidifier_pin, 27);
        assert_eq!(config.relays.heater1_pin, 4);
    }

    #[test]
    fn test_io_timeout_must_undercut_sensor_timeout() {
        let err = DaemonConfig::from_toml("[control]\nio_timeout_ms = 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_pins_rejected() {
        let err = DaemonConfig::from_toml("[relays]\nheater2_pin = 4\n").unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            DaemonConfig::from_toml("[control\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
