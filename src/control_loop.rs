//! The periodic control engine.
//!
//! Each tick reads the sensor, evaluates the heater interlocks, steps both
//! controllers, applies relay changes and publishes one [`Status`]. The
//! imperative operations (`start`, `stop`, `reset`, `apply_settings`) may be
//! called at any time from any task.
//!
//! Lock order: the engine mutex serialises ticks; the settings lock is taken
//! after the sensor read and held (shared) until the status is published.
//! Operations that change settings take it exclusively, so they wait for an
//! in-flight relay phase and the next tick sees their effect.
//! The relay and sensor self-tests take both locks in the same order and
//! hold them for the whole run.

use crate::hal::{DriverError, RelayDriver, SensorDriver};
use crate::relay::{CommandList, RelayBank, RelayCheck, RelayId, RelayPort, RELAY_COUNT};
use crate::safety::{SafetyEventRecord, SafetyMonitor};
use crate::sensor::{Reading, SensorReader};
use crate::settings::{Settings, SettingsError, SettingsStore, SettingsUpdate};
use crate::sim::{SimFault, SimulatedIncubator};
use crate::status::{Counters, RunningFlags, Status};
use crate::subsystems::{
    Action, Controller, HumidityController, HumidityState, SubsystemId, Target,
    TemperatureController, TemperatureState,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay self-test timing per relay.
pub const RELAY_TEST_ON: Duration = Duration::from_secs(1);
pub const RELAY_TEST_OFF: Duration = Duration::from_millis(500);
pub const MAX_SENSOR_TEST_SAMPLES: u32 = 20;
/// Longest dwell or interval a self-test accepts.
pub const MAX_TEST_DWELL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("relay driver failure: {0}")]
    Relay(#[from] DriverError),
    #[error("{0}")]
    Refused(String),
    #[error("fault injection needs the simulated incubator")]
    NoSimulator,
}

/// Tick-owned state, only touched under the engine mutex.
struct Engine {
    sensor: SensorReader,
    relays: RelayBank,
    safety: SafetyMonitor,
    temperature: TemperatureController,
    humidity: HumidityController,
    seen_generation: u64,
    seq: u64,
    tick_errors: u32,
}

impl Engine {
    fn reset_controllers(&mut self) {
        self.temperature.reset();
        self.humidity.reset();
        self.safety.reset();
    }

    fn counters(&self, out_of_band_failures: u32) -> Counters {
        Counters {
            ticks: self.seq,
            relay_write_failures: self.relays.write_failures().saturating_add(out_of_band_failures),
            safety_trips: self.safety.trip_count(),
            tick_errors: self.tick_errors,
        }
    }
}

pub struct ControlLoop {
    engine: Mutex<Engine>,
    settings: Arc<SettingsStore>,
    relay_port: RelayPort,
    simulator: Option<Arc<SimulatedIncubator>>,
    /// Bumped by `reset`; a tick that sees a new value clears controller state.
    generation: AtomicU64,
    /// Set after any write outside the relay bank so its tracked state is
    /// dropped before the next tick plans commands.
    relays_dirty: AtomicBool,
    out_of_band_failures: AtomicU32,
    status_tx: watch::Sender<Status>,
    started: Instant,
}

impl ControlLoop {
    pub fn new(
        sensor: Arc<dyn SensorDriver>,
        relays: Arc<dyn RelayDriver>,
        settings: Arc<SettingsStore>,
        io_timeout: Duration,
    ) -> Self {
        let initial = settings
            .try_snapshot()
            .map(|s| Status::initial(&s))
            .unwrap_or_default();
        let (status_tx, _) = watch::channel(initial);
        let relay_port = RelayPort::new(relays, io_timeout);

        Self {
            engine: Mutex::new(Engine {
                sensor: SensorReader::new(sensor, io_timeout),
                relays: RelayBank::new(relay_port.clone()),
                safety: SafetyMonitor::new(),
                temperature: TemperatureController::new(),
                humidity: HumidityController::new(),
                seen_generation: 0,
                seq: 0,
                tick_errors: 0,
            }),
            settings,
            relay_port,
            simulator: None,
            generation: AtomicU64::new(0),
            relays_dirty: AtomicBool::new(false),
            out_of_band_failures: AtomicU32::new(0),
            status_tx,
            started: Instant::now(),
        }
    }

    /// Routes fault injection to the simulated chamber. Pass the same
    /// instance that serves as both drivers.
    pub fn with_simulator(mut self, simulator: Arc<SimulatedIncubator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Runs one tick and returns the status it published. Failures inside the
    /// tick are contained here: all relays are forced off and the published
    /// status carries the error.
    pub async fn tick(&self) -> Status {
        let mut engine = self.engine.lock().await;
        let now = self.now_ms();
        match self.run_tick(&mut engine, now).await {
            Ok(status) => status,
            Err(e) => self.fail_safe(&mut engine, now, e.to_string()).await,
        }
    }

    async fn run_tick(&self, engine: &mut Engine, now: u64) -> Result<Status, ControlError> {
        // Sensor I/O happens before the settings lock so a slow bus never
        // delays settings changes.
        let reading = engine.sensor.read(now).await;

        let settings = self.settings.read().await;

        let generation = self.generation.load(Ordering::Acquire);
        if generation != engine.seen_generation {
            debug!("reset generation {} observed, clearing controller state", generation);
            engine.reset_controllers();
            engine.seen_generation = generation;
        }
        if self.relays_dirty.swap(false, Ordering::AcqRel) {
            engine.relays.invalidate();
        }

        let verdict = engine.safety.evaluate(
            engine.sensor.last_temperature_ok_ms(),
            &reading,
            &settings.temperature,
        );
        let humidity_failure = engine.safety.humidity_sensor_failure(
            engine.sensor.last_humidity_ok_ms(),
            &reading,
            &settings.temperature,
        );

        let temperature_state =
            engine
                .temperature
                .step(reading.temperature_f, &settings.temperature, verdict.any());
        let humidity_state =
            engine
                .humidity
                .step(reading.humidity_pct, &settings.humidity, humidity_failure);

        let mut desired: CommandList = engine.temperature.relay_commands();
        let _ = desired.extend_from_slice(&engine.humidity.relay_commands());

        let report = engine.relays.drive(&desired).await?;
        if report.failed > 0 {
            warn!("{} relay write(s) failed this tick, will resend", report.failed);
        }

        engine.seq += 1;
        let mut status = Status {
            seq: engine.seq,
            timestamp_ms: now,
            uptime_s: now / 1000,
            reading,
            temperature_state,
            humidity_state,
            safety: verdict,
            humidity_sensor_failure: humidity_failure,
            is_running: RunningFlags::from(&*settings),
            last_temperature_ok_ms: engine.sensor.last_temperature_ok_ms(),
            last_humidity_ok_ms: engine.sensor.last_humidity_ok_ms(),
            counters: engine.counters(self.out_of_band_failures.load(Ordering::Relaxed)),
            ..Status::default()
        };
        status.set_relay_mask(engine.relays.mask());

        debug!("{}", status.summary());
        self.status_tx.send_replace(status.clone());
        drop(settings);
        Ok(status)
    }

    async fn fail_safe(&self, engine: &mut Engine, now: u64, message: String) -> Status {
        error!("tick failed: {}; forcing all relays off", message);
        engine.tick_errors = engine.tick_errors.saturating_add(1);
        engine.relays.force_all_off().await;
        engine.reset_controllers();
        engine.seq += 1;

        let counters = engine.counters(self.out_of_band_failures.load(Ordering::Relaxed));
        let mask = engine.relays.mask();
        let mut published = Status::default();
        self.status_tx.send_modify(|status| {
            status.seq = engine.seq;
            status.timestamp_ms = now;
            status.uptime_s = now / 1000;
            status.temperature_state = TemperatureState::Idle;
            status.humidity_state = HumidityState::Idle;
            status.set_relay_mask(mask);
            status.counters = counters;
            status.last_error = Some(message);
            published = status.clone();
        });
        published
    }

    /// Handles a tick that did not complete (the task panicked or was
    /// cancelled).
    async fn contain_failure(&self, message: String) -> Status {
        let mut engine = self.engine.lock().await;
        let now = self.now_ms();
        self.fail_safe(&mut engine, now, message).await
    }

    /// Drives ticks every `interval` until `shutdown` resolves, then forces
    /// every relay off. Late ticks are skipped, never stacked.
    pub async fn run<S>(self: Arc<Self>, interval: Duration, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("control loop running, tick every {} ms", interval.as_millis());
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    let handle = tokio::spawn(async move { this.tick().await });
                    if let Err(e) = handle.await {
                        self.contain_failure(format!("tick task failed: {}", e)).await;
                    }
                }
            }
        }

        info!("control loop stopping");
        self.shutdown().await;
    }

    /// Forces every relay off through the engine's bank.
    pub async fn shutdown(&self) {
        let mut engine = self.engine.lock().await;
        let report = engine.relays.force_all_off().await;
        engine.reset_controllers();
        if report.failed > 0 {
            error!("{} relay(s) could not be switched off at shutdown", report.failed);
        }
        let mask = engine.relays.mask();
        self.status_tx.send_modify(|status| {
            status.temperature_state = TemperatureState::Idle;
            status.humidity_state = HumidityState::Idle;
            status.set_relay_mask(mask);
        });
    }

    pub async fn start(&self, target: Target) -> Result<Settings, ControlError> {
        self.control(target, Action::Start).await
    }

    pub async fn stop(&self, target: Target) -> Result<Settings, ControlError> {
        self.control(target, Action::Stop).await
    }

    /// Sets `enabled` for the targeted subsystems and persists. Thresholds are
    /// left alone. Stopping switches the subsystem's relays off immediately.
    pub async fn control(&self, target: Target, action: Action) -> Result<Settings, ControlError> {
        let enabled = action == Action::Start;
        let mut guard = self.settings.write().await;

        let mut next = *guard;
        for id in target.subsystems() {
            match id {
                SubsystemId::Temperature => next.temperature.enabled = enabled,
                SubsystemId::Humidity => next.humidity.enabled = enabled,
            }
        }
        next.validate()?;
        *guard = next;
        self.settings.persist(&next).await;

        let mut switched_off: Vec<RelayId> = Vec::new();
        let mut failed = 0;
        if !enabled {
            let relays: Vec<RelayId> = target
                .subsystems()
                .iter()
                .flat_map(|id| id.relays().iter().copied())
                .collect();
            (switched_off, failed) = self.force_off_out_of_band(&relays).await;
        }

        self.status_tx.send_modify(|status| {
            *status = status.with_relays_off(&switched_off);
            status.counters.relay_write_failures =
                status.counters.relay_write_failures.saturating_add(failed);
            status.is_running = RunningFlags::from(&next);
            if !enabled {
                if target.includes(SubsystemId::Temperature) {
                    status.temperature_state = TemperatureState::Idle;
                }
                if target.includes(SubsystemId::Humidity) {
                    status.humidity_state = HumidityState::Idle;
                }
            }
        });
        drop(guard);

        info!("{:?} {}", action, target);
        Ok(next)
    }

    /// Restores default settings (both subsystems disabled), switches every
    /// relay off and returns controller state to `Idle`. Calling it twice
    /// leaves the same published status.
    pub async fn reset(&self) -> Result<Settings, ControlError> {
        let mut guard = self.settings.write().await;
        let defaults = Settings::default();
        *guard = defaults;
        self.settings.persist(&defaults).await;
        self.generation.fetch_add(1, Ordering::AcqRel);

        let (switched_off, failed) = self.force_off_out_of_band(&RelayId::ALL).await;

        self.status_tx.send_modify(|status| {
            *status = status.with_relays_off(&switched_off);
            status.counters.relay_write_failures =
                status.counters.relay_write_failures.saturating_add(failed);
            status.temperature_state = TemperatureState::Idle;
            status.humidity_state = HumidityState::Idle;
            status.is_running = RunningFlags::from(&defaults);
        });
        drop(guard);

        info!("controller reset to defaults");
        Ok(defaults)
    }

    /// Validates the merged update and swaps it in. A rejected update leaves
    /// the current settings untouched.
    pub async fn apply_settings(&self, update: &SettingsUpdate) -> Result<Settings, ControlError> {
        let applied = match self.settings.apply(update).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("settings update rejected: {}", e);
                return Err(e.into());
            }
        };
        self.status_tx.send_modify(|status| {
            status.is_running = RunningFlags::from(&applied);
        });
        info!("settings updated: {:?}", applied);
        Ok(applied)
    }

    pub fn get_status(&self) -> Status {
        self.status_tx.borrow().clone()
    }

    pub async fn get_settings(&self) -> Settings {
        self.settings.snapshot().await
    }

    /// Receiver that observes every published status.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub async fn safety_events(&self) -> Vec<SafetyEventRecord> {
        self.engine.lock().await.safety.get_event_history().to_vec()
    }

    pub fn inject_fault(&self, fault: SimFault) -> Result<(), ControlError> {
        let simulator = self.simulator.as_ref().ok_or(ControlError::NoSimulator)?;
        simulator.inject_fault(fault);
        Ok(())
    }

    pub fn clear_faults(&self) -> Result<(), ControlError> {
        let simulator = self.simulator.as_ref().ok_or(ControlError::NoSimulator)?;
        simulator.clear_faults();
        Ok(())
    }

    /// Cycles each relay ON for `on_time`, then OFF for `off_time`. Refused
    /// while either subsystem is enabled. Ticks wait until the cycle ends and
    /// the next one resends every relay.
    pub async fn test_relays(
        &self,
        on_time: Duration,
        off_time: Duration,
    ) -> Result<Vec<RelayCheck>, ControlError> {
        if on_time > MAX_TEST_DWELL || off_time > MAX_TEST_DWELL {
            return Err(dwell_too_long());
        }
        let mut engine = self.engine.lock().await;
        let settings = self.settings.read().await;
        ensure_idle(&settings)?;

        info!("relay self-test started");
        let mut checks = Vec::with_capacity(RELAY_COUNT);
        let mut confirmed_off = Vec::with_capacity(RELAY_COUNT);
        let mut failed = 0;
        for relay in RelayId::ALL {
            let mut error = match self.relay_port.write(relay, true).await {
                Ok(()) => {
                    tokio::time::sleep(on_time).await;
                    None
                }
                Err(e) => {
                    failed += 1;
                    Some(format!("ON: {}", e))
                }
            };
            // OFF is written even if ON failed.
            match self.relay_port.write(relay, false).await {
                Ok(()) => confirmed_off.push(relay),
                Err(e) => {
                    failed += 1;
                    error!("{} may still be ON after self-test: {}", relay.name(), e);
                    error.get_or_insert(format!("OFF: {}", e));
                }
            }
            tokio::time::sleep(off_time).await;

            info!("relay self-test {}: {}", relay.name(), error.as_deref().unwrap_or("passed"));
            checks.push(RelayCheck {
                relay,
                passed: error.is_none(),
                error,
            });
        }
        engine.relays.invalidate();
        drop(settings);

        self.out_of_band_failures.fetch_add(failed, Ordering::Relaxed);
        self.status_tx.send_modify(|status| {
            *status = status.with_relays_off(&confirmed_off);
            status.counters.relay_write_failures =
                status.counters.relay_write_failures.saturating_add(failed);
        });
        Ok(checks)
    }

    /// Takes `samples` sensor readings `interval` apart. Refused while either
    /// subsystem is enabled. Readings count towards the sensor's last-success
    /// timestamps like any tick read.
    pub async fn test_sensor(
        &self,
        samples: u32,
        interval: Duration,
    ) -> Result<Vec<Reading>, ControlError> {
        if samples == 0 || samples > MAX_SENSOR_TEST_SAMPLES {
            return Err(ControlError::Refused(format!(
                "sample count must be between 1 and {}",
                MAX_SENSOR_TEST_SAMPLES
            )));
        }
        if interval > MAX_TEST_DWELL {
            return Err(dwell_too_long());
        }
        let mut engine = self.engine.lock().await;
        let settings = self.settings.read().await;
        ensure_idle(&settings)?;

        info!("sensor self-test: {} reading(s)", samples);
        let mut readings = Vec::with_capacity(samples as usize);
        for n in 0..samples {
            if n > 0 {
                tokio::time::sleep(interval).await;
            }
            let reading = engine.sensor.read(self.now_ms()).await;
            info!(
                "sensor self-test {}: temp={:?}F humidity={:?}%",
                n + 1,
                reading.temperature_f,
                reading.humidity_pct
            );
            readings.push(reading);
        }
        Ok(readings)
    }

    /// Writes OFF to `relays` directly, bypassing the bank. Returns the relays
    /// that were confirmed off and the number of failed writes.
    async fn force_off_out_of_band(&self, relays: &[RelayId]) -> (Vec<RelayId>, u32) {
        let mut confirmed = Vec::with_capacity(relays.len());
        let mut failed = 0;
        for &relay in relays {
            match self.relay_port.write(relay, false).await {
                Ok(()) => confirmed.push(relay),
                Err(e) => {
                    failed += 1;
                    error!("failed to force {} off: {}", relay.name(), e);
                }
            }
        }
        self.out_of_band_failures.fetch_add(failed, Ordering::Relaxed);
        self.relays_dirty.store(true, Ordering::Release);
        (confirmed, failed)
    }
}

fn ensure_idle(settings: &Settings) -> Result<(), ControlError> {
    if settings.temperature.enabled || settings.humidity.enabled {
        return Err(ControlError::Refused(
            "stop temperature and humidity control before running diagnostics".into(),
        ));
    }
    Ok(())
}

fn dwell_too_long() -> ControlError {
    ControlError::Refused(format!(
        "self-test timings are limited to {} ms",
        MAX_TEST_DWELL.as_millis()
    ))
}
