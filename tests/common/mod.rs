#![allow(dead_code)]

use incubator::hal::{fahrenheit_to_celsius, DriverError, RelayDriver, SensorDriver};
use incubator::{ControlLoop, RelayId, Settings, SettingsStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_IO_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
struct Conditions {
    temperature_f: Option<f32>,
    humidity_pct: Option<f32>,
    secondary_f: Option<f32>,
    hang: Option<Duration>,
}

/// Sensor whose readings are set by the test.
pub struct ScriptedSensor {
    conditions: Mutex<Conditions>,
}

impl ScriptedSensor {
    pub fn new(temperature_f: f32, humidity_pct: f32) -> Arc<Self> {
        Arc::new(Self {
            conditions: Mutex::new(Conditions {
                temperature_f: Some(temperature_f),
                humidity_pct: Some(humidity_pct),
                secondary_f: None,
                hang: None,
            }),
        })
    }

    pub fn set_temperature(&self, temperature_f: Option<f32>) {
        self.conditions.lock().unwrap().temperature_f = temperature_f;
    }

    pub fn set_humidity(&self, humidity_pct: Option<f32>) {
        self.conditions.lock().unwrap().humidity_pct = humidity_pct;
    }

    pub fn set_secondary(&self, secondary_f: Option<f32>) {
        self.conditions.lock().unwrap().secondary_f = secondary_f;
    }

    pub fn hang_for(&self, delay: Option<Duration>) {
        self.conditions.lock().unwrap().hang = delay;
    }

    fn current(&self) -> Conditions {
        let conditions = *self.conditions.lock().unwrap();
        if let Some(delay) = conditions.hang {
            std::thread::sleep(delay);
        }
        conditions
    }
}

impl SensorDriver for ScriptedSensor {
    fn read_temperature_c(&self) -> Result<f32, DriverError> {
        self.current()
            .temperature_f
            .map(fahrenheit_to_celsius)
            .ok_or_else(|| DriverError::Bus("no ACK".into()))
    }

    fn read_humidity(&self) -> Result<f32, DriverError> {
        self.current()
            .humidity_pct
            .ok_or_else(|| DriverError::Bus("CRC mismatch".into()))
    }

    fn read_secondary_temperature_c(&self) -> Result<Option<f32>, DriverError> {
        Ok(self.current().secondary_f.map(fahrenheit_to_celsius))
    }
}

#[derive(Debug, Default)]
struct RelayLog {
    writes: Vec<(RelayId, bool)>,
    state: [bool; 3],
    failing: Option<RelayId>,
    panic_on: Option<RelayId>,
}

/// Relay bank double that records every write.
#[derive(Debug, Default)]
pub struct RecordingRelays {
    log: Mutex<RelayLog>,
}

impl RecordingRelays {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(RelayId, bool)> {
        self.log.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.log.lock().unwrap().writes.len()
    }

    pub fn is_on(&self, relay: RelayId) -> bool {
        self.log.lock().unwrap().state[relay.channel() as usize]
    }

    pub fn all_off(&self) -> bool {
        RelayId::ALL.iter().all(|&relay| !self.is_on(relay))
    }

    /// Writes to `relay` fail with a bus error.
    pub fn fail(&self, relay: Option<RelayId>) {
        self.log.lock().unwrap().failing = relay;
    }

    /// Switching `relay` ON panics inside the driver.
    pub fn panic_on(&self, relay: Option<RelayId>) {
        self.log.lock().unwrap().panic_on = relay;
    }
}

impl RelayDriver for RecordingRelays {
    fn set(&self, relay: RelayId, on: bool) -> Result<(), DriverError> {
        let mut log = self.log.lock().unwrap();
        if on && log.panic_on == Some(relay) {
            drop(log);
            panic!("relay driver bug on {}", relay.name());
        }
        if log.failing == Some(relay) {
            return Err(DriverError::Bus(format!("{} not responding", relay.name())));
        }
        log.writes.push((relay, on));
        log.state[relay.channel() as usize] = on;
        Ok(())
    }
}

pub fn control_loop(sensor: Arc<ScriptedSensor>, relays: Arc<RecordingRelays>) -> ControlLoop {
    ControlLoop::new(
        sensor,
        relays,
        Arc::new(SettingsStore::in_memory(Settings::default())),
        TEST_IO_TIMEOUT,
    )
}

/// Unique scratch path under the system temp dir.
pub fn temp_path(name: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("incubator-test-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_file(&path);
    path
}
