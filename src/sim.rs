//! Simulated incubator.
//!
//! Implements both driver capabilities over a lumped thermal and moisture
//! model, so the daemon and the tests can run the real control loop without
//! hardware. Faults can be injected to exercise the safety paths.

use crate::hal::{fahrenheit_to_celsius, DriverError, RelayDriver, SensorDriver};
use crate::relay::{RelayId, RELAY_COUNT};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MAX_ACTIVE_FAULTS: usize = 8;

/// Temperature rise per second contributed by one heater (°F/s).
const HEATER_GAIN_F_PER_S: f32 = 0.02;
/// Newtonian loss coefficient towards ambient (1/s).
const THERMAL_LOSS_PER_S: f32 = 0.0005;
const HUMIDIFIER_GAIN_PCT_PER_S: f32 = 0.15;
const MOISTURE_LOSS_PER_S: f32 = 0.002;
/// Peak-to-peak sensor noise.
const NOISE_F: f32 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SimFault {
    /// Every temperature read fails.
    TemperatureDropout,
    /// Every humidity read fails.
    HumidityDropout,
    /// Sensor reads block for this long before answering.
    SensorHang { millis: u64 },
    /// Writes to this relay fail and its contact keeps its state.
    StuckRelay { relay: RelayId },
    /// Secondary line reads this much hotter than the chamber.
    SecondaryOffset { offset_f: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub ambient_f: f32,
    pub ambient_humidity_pct: f32,
    pub initial_f: f32,
    pub initial_humidity_pct: f32,
    /// Model seconds per wall-clock second; 0 freezes the model so tests
    /// can advance it explicitly.
    pub time_scale: f32,
    pub secondary_line: bool,
    pub noise: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ambient_f: 72.0,
            ambient_humidity_pct: 40.0,
            initial_f: 72.0,
            initial_humidity_pct: 40.0,
            time_scale: 1.0,
            secondary_line: false,
            noise: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimSnapshot {
    pub temperature_f: f32,
    pub humidity_pct: f32,
    pub relays: [bool; RELAY_COUNT],
    pub relay_writes: u32,
    pub sensor_reads: u32,
}

#[derive(Debug)]
struct Model {
    temperature_f: f32,
    humidity_pct: f32,
    relays: [bool; RELAY_COUNT],
    faults: Vec<SimFault, MAX_ACTIVE_FAULTS>,
    last_update: Instant,
    relay_writes: u32,
    sensor_reads: u32,
    rng_state: u64,
}

impl Model {
    fn advance(&mut self, dt_s: f32, config: &SimConfig) {
        if dt_s <= 0.0 {
            return;
        }
        let heaters = self.relays[..2].iter().filter(|&&on| on).count() as f32;
        let heat_in = heaters * HEATER_GAIN_F_PER_S;
        let heat_out = THERMAL_LOSS_PER_S * (self.temperature_f - config.ambient_f);
        self.temperature_f += (heat_in - heat_out) * dt_s;

        let moisture_in = if self.relays[RelayId::Humidifier.channel() as usize] {
            HUMIDIFIER_GAIN_PCT_PER_S
        } else {
            0.0
        };
        let moisture_out = MOISTURE_LOSS_PER_S * (self.humidity_pct - config.ambient_humidity_pct);
        self.humidity_pct = (self.humidity_pct + (moisture_in - moisture_out) * dt_s).clamp(0.0, 100.0);
    }

    fn sync(&mut self, config: &SimConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        self.advance(elapsed * config.time_scale, config);
    }

    // Linear congruential generator, fixed seed for reproducible runs.
    fn noise(&mut self) -> f32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let unit = (self.rng_state >> 40) as f32 / (1u64 << 24) as f32;
        (unit - 0.5) * NOISE_F
    }

    fn has(&self, predicate: impl Fn(&SimFault) -> bool) -> bool {
        self.faults.iter().any(predicate)
    }

    fn hang(&self) -> Option<Duration> {
        self.faults.iter().find_map(|f| match f {
            SimFault::SensorHang { millis } => Some(Duration::from_millis(*millis)),
            _ => None,
        })
    }
}

/// Incubator chamber model shared by the sensor and relay sides.
#[derive(Debug)]
pub struct SimulatedIncubator {
    config: SimConfig,
    model: Mutex<Model>,
}

impl SimulatedIncubator {
    pub fn new(config: SimConfig) -> Self {
        info!(
            "Simulated incubator: ambient {:.1}F / {:.0}%",
            config.ambient_f, config.ambient_humidity_pct
        );
        Self {
            model: Mutex::new(Model {
                temperature_f: config.initial_f,
                humidity_pct: config.initial_humidity_pct,
                relays: [false; RELAY_COUNT],
                faults: Vec::new(),
                last_update: Instant::now(),
                relay_writes: 0,
                sensor_reads: 0,
                rng_state: 0x1234_5678_9ABC_DEF0,
            }),
            config,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Model>, DriverError> {
        self.model
            .lock()
            .map_err(|_| DriverError::Aborted("simulator state poisoned".into()))
    }

    /// Advances the model by `dt` of simulated time.
    pub fn advance(&self, dt: Duration) {
        if let Ok(mut model) = self.lock() {
            model.advance(dt.as_secs_f32(), &self.config);
        }
    }

    pub fn set_conditions(&self, temperature_f: f32, humidity_pct: f32) {
        if let Ok(mut model) = self.lock() {
            model.temperature_f = temperature_f;
            model.humidity_pct = humidity_pct;
        }
    }

    pub fn inject_fault(&self, fault: SimFault) {
        if let Ok(mut model) = self.lock() {
            if model.faults.contains(&fault) {
                return;
            }
            if model.faults.is_full() {
                model.faults.remove(0);
            }
            let _ = model.faults.push(fault);
            info!("Simulator fault injected: {:?}", fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut model) = self.lock() {
            model.faults.clear();
            info!("Simulator faults cleared");
        }
    }

    pub fn snapshot(&self) -> SimSnapshot {
        match self.lock() {
            Ok(model) => SimSnapshot {
                temperature_f: model.temperature_f,
                humidity_pct: model.humidity_pct,
                relays: model.relays,
                relay_writes: model.relay_writes,
                sensor_reads: model.sensor_reads,
            },
            Err(_) => SimSnapshot::default(),
        }
    }

    fn sample<T>(&self, read: impl FnOnce(&mut Model) -> Result<T, DriverError>) -> Result<T, DriverError> {
        let hang = self.lock()?.hang();
        if let Some(delay) = hang {
            std::thread::sleep(delay);
        }
        let mut model = self.lock()?;
        model.sync(&self.config);
        model.sensor_reads = model.sensor_reads.saturating_add(1);
        read(&mut model)
    }
}

impl SensorDriver for SimulatedIncubator {
    fn read_temperature_c(&self) -> Result<f32, DriverError> {
        let noise = self.config.noise;
        self.sample(|model| {
            if model.has(|f| *f == SimFault::TemperatureDropout) {
                return Err(DriverError::Bus("no ACK from sensor".into()));
            }
            let jitter = if noise { model.noise() } else { 0.0 };
            Ok(fahrenheit_to_celsius(model.temperature_f + jitter))
        })
    }

    fn read_humidity(&self) -> Result<f32, DriverError> {
        self.sample(|model| {
            if model.has(|f| *f == SimFault::HumidityDropout) {
                return Err(DriverError::Bus("humidity CRC mismatch".into()));
            }
            Ok(model.humidity_pct)
        })
    }

    fn read_secondary_temperature_c(&self) -> Result<Option<f32>, DriverError> {
        if !self.config.secondary_line {
            return Ok(None);
        }
        let model = self.lock()?;
        let offset = model
            .faults
            .iter()
            .find_map(|f| match f {
                SimFault::SecondaryOffset { offset_f } => Some(*offset_f),
                _ => None,
            })
            .unwrap_or(0.0);
        Ok(Some(fahrenheit_to_celsius(model.temperature_f + offset)))
    }
}

impl RelayDriver for SimulatedIncubator {
    fn set(&self, relay: RelayId, on: bool) -> Result<(), DriverError> {
        let mut model = self.lock()?;
        model.sync(&self.config);
        if model.has(|f| *f == SimFault::StuckRelay { relay }) {
            return Err(DriverError::Bus(format!("{} contact stuck", relay.name())));
        }
        model.relays[relay.channel() as usize] = on;
        model.relay_writes = model.relay_writes.saturating_add(1);
        debug!("sim relay {} -> {}", relay.name(), on);
        Ok(())
    }
}
