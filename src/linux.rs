//! Linux sysfs drivers for a Raspberry Pi style board.
//!
//! Relays are driven through the legacy `/sys/class/gpio` interface; the
//! SHT3x is read through its hwmon kernel driver, which reports
//! milli-degrees Celsius and milli-percent relative humidity.

use crate::config::{RelayConfig, SensorConfig};
use crate::hal::{DriverError, RelayDriver, SensorDriver};
use crate::relay::RelayId;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct SysfsRelayDriver {
    root: PathBuf,
    pins: [u8; 3],
    active_low: bool,
}

impl SysfsRelayDriver {
    /// Exports and configures every relay pin as an output, switched off.
    pub fn open(config: &RelayConfig) -> Result<Self, DriverError> {
        let driver = Self {
            root: config.gpio_root.clone(),
            pins: [
                config.pin(RelayId::Heater1),
                config.pin(RelayId::Heater2),
                config.pin(RelayId::Humidifier),
            ],
            active_low: config.active_low,
        };

        for relay in RelayId::ALL {
            let pin = driver.pin(relay);
            let dir = driver.pin_dir(pin);
            if !dir.exists() {
                write_sysfs(&driver.root.join("export"), &pin.to_string())?;
            }
            // "high"/"low" sets direction and initial level in one write.
            let initial = if driver.active_low { "high" } else { "low" };
            write_sysfs(&dir.join("direction"), initial)?;
            info!("{} on GPIO {} configured", relay.name(), pin);
        }
        Ok(driver)
    }

    fn pin(&self, relay: RelayId) -> u8 {
        self.pins[relay.channel() as usize]
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn level(&self, on: bool) -> &'static str {
        if on != self.active_low {
            "1"
        } else {
            "0"
        }
    }
}

impl RelayDriver for SysfsRelayDriver {
    fn set(&self, relay: RelayId, on: bool) -> Result<(), DriverError> {
        let path = self.pin_dir(self.pin(relay)).join("value");
        write_sysfs(&path, self.level(on))
    }
}

pub struct HwmonSensorDriver {
    primary: PathBuf,
    secondary: Option<PathBuf>,
}

impl HwmonSensorDriver {
    pub fn open(config: &SensorConfig) -> Result<Self, DriverError> {
        if !config.hwmon_path.exists() {
            return Err(DriverError::NotConnected);
        }
        info!("Reading SHT3x through {}", config.hwmon_path.display());
        Ok(Self {
            primary: config.hwmon_path.clone(),
            secondary: config.secondary_hwmon_path.clone(),
        })
    }
}

impl SensorDriver for HwmonSensorDriver {
    fn read_temperature_c(&self) -> Result<f32, DriverError> {
        read_milli(&self.primary.join("temp1_input"))
    }

    fn read_humidity(&self) -> Result<f32, DriverError> {
        read_milli(&self.primary.join("humidity1_input"))
    }

    fn read_secondary_temperature_c(&self) -> Result<Option<f32>, DriverError> {
        match &self.secondary {
            Some(dir) => read_milli(&dir.join("temp1_input")).map(Some),
            None => Ok(None),
        }
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<(), DriverError> {
    std::fs::write(path, value).map_err(|e| DriverError::Bus(format!("{}: {}", path.display(), e)))
}

fn read_milli(path: &Path) -> Result<f32, DriverError> {
    let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DriverError::NotConnected,
        _ => DriverError::Bus(format!("{}: {}", path.display(), e)),
    })?;
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|_| DriverError::Bus(format!("{}: unexpected value {:?}", path.display(), raw.trim())))?;
    Ok(milli as f32 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("incubator-linux-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_relay_levels_active_low() {
        let root = scratch_dir("gpio");
        for pin in [4, 17, 18] {
            std::fs::create_dir_all(root.join(format!("gpio{}", pin))).unwrap();
        }
        let config = RelayConfig {
            gpio_root: root.clone(),
            ..RelayConfig::default()
        };

        let driver = SysfsRelayDriver::open(&config).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("gpio4/direction")).unwrap(), "high");

        driver.set(RelayId::Heater2, true).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("gpio17/value")).unwrap(), "0");
        driver.set(RelayId::Heater2, false).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("gpio17/value")).unwrap(), "1");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_hwmon_reads_milli_units() {
        let dir = scratch_dir("hwmon");
        std::fs::write(dir.join("temp1_input"), "37650\n").unwrap();
        std::fs::write(dir.join("humidity1_input"), "58200\n").unwrap();

        let driver = HwmonSensorDriver::open(&SensorConfig {
            hwmon_path: dir.clone(),
            secondary_hwmon_path: None,
        })
        .unwrap();

        assert!((driver.read_temperature_c().unwrap() - 37.65).abs() < 1e-4);
        assert!((driver.read_humidity().unwrap() - 58.2).abs() < 1e-4);
        assert_eq!(driver.read_secondary_temperature_c().unwrap(), None);

        std::fs::write(dir.join("temp1_input"), "garbage").unwrap();
        assert!(matches!(driver.read_temperature_c(), Err(DriverError::Bus(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_hwmon_is_not_connected() {
        let config = SensorConfig {
            hwmon_path: PathBuf::from("/nonexistent/hwmon99"),
            secondary_hwmon_path: None,
        };
        assert!(matches!(HwmonSensorDriver::open(&config), Err(DriverError::NotConnected)));
    }
}
