use crate::relay::RelayId;
use crate::safety::SafetyVerdict;
use crate::sensor::Reading;
use crate::settings::Settings;
use crate::subsystems::{HumidityState, TemperatureState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStates {
    pub heater1: bool,
    pub heater2: bool,
    pub humidifier: bool,
}

impl RelayStates {
    pub fn from_mask(mask: u8) -> Self {
        Self {
            heater1: mask & RelayId::Heater1.mask() != 0,
            heater2: mask & RelayId::Heater2.mask() != 0,
            humidifier: mask & RelayId::Humidifier.mask() != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningFlags {
    pub temperature: bool,
    pub humidity: bool,
}

impl From<&Settings> for RunningFlags {
    fn from(settings: &Settings) -> Self {
        Self {
            temperature: settings.temperature.enabled,
            humidity: settings.humidity.enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub ticks: u64,
    pub relay_write_failures: u32,
    pub safety_trips: u32,
    pub tick_errors: u32,
}

/// Snapshot of the engine, published once per tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub uptime_s: u64,
    pub reading: Reading,
    pub temperature_state: TemperatureState,
    pub humidity_state: HumidityState,
    /// Bit n set when relay channel n is ON.
    pub relay_mask: u8,
    pub relays: RelayStates,
    pub safety: SafetyVerdict,
    pub humidity_sensor_failure: bool,
    pub is_running: RunningFlags,
    pub last_temperature_ok_ms: Option<u64>,
    pub last_humidity_ok_ms: Option<u64>,
    pub counters: Counters,
    pub last_error: Option<String>,
}

impl Status {
    /// Status before the first tick.
    pub fn initial(settings: &Settings) -> Self {
        Self {
            is_running: RunningFlags::from(settings),
            ..Self::default()
        }
    }

    pub fn set_relay_mask(&mut self, mask: u8) {
        self.relay_mask = mask;
        self.relays = RelayStates::from_mask(mask);
    }

    /// Copy of this status with the given relays shown OFF.
    pub fn with_relays_off(&self, relays: &[RelayId]) -> Self {
        let mut next = self.clone();
        let cleared = relays.iter().fold(self.relay_mask, |mask, r| mask & !r.mask());
        next.set_relay_mask(cleared);
        next
    }

    pub fn heaters_on(&self) -> bool {
        self.relays.heater1 && self.relays.heater2
    }

    /// One-line summary for logs and the compact CLI format.
    pub fn summary(&self) -> String {
        format!(
            "#{} temp={} hum={} heat={:?} humid={:?} relays={:03b}{}",
            self.seq,
            fmt_reading(self.reading.temperature_f, "F"),
            fmt_reading(self.reading.humidity_pct, "%"),
            self.temperature_state,
            self.humidity_state,
            self.relay_mask,
            if self.safety.any() { " SAFETY" } else { "" }
        )
    }
}

fn fmt_reading(value: Option<f32>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "--".to_string(),
    }
}
