use crate::sensor::Reading;
use crate::settings::TemperatureSettings;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MAX_SAFETY_EVENTS: usize = 32;

/// Per-tick safety assessment. Any flag forces both heaters off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub sensor_failure: bool,
    pub overheat_triggered: bool,
    pub cutoff_triggered: bool,
}

impl SafetyVerdict {
    pub fn any(&self) -> bool {
        self.sensor_failure || self.overheat_triggered || self.cutoff_triggered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    SensorFailure,
    Overheat,
    Cutoff,
}

impl SafetyEvent {
    fn describe(self) -> &'static str {
        match self {
            SafetyEvent::SensorFailure => "temperature sensor failure",
            SafetyEvent::Overheat => "secondary over-temperature line",
            SafetyEvent::Cutoff => "safety cutoff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp_ms: u64,
    /// `true` for a trip edge, `false` when the condition cleared.
    pub tripped: bool,
    pub temperature_f: Option<f32>,
}

/// Evaluates the heater interlocks and remembers when each one tripped
/// and cleared.
#[derive(Debug, Default)]
pub struct SafetyMonitor {
    last_verdict: SafetyVerdict,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    trip_count: u32,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes this tick's verdict. `now` is the reading's timestamp; a
    /// channel that has never read successfully counts as stale.
    pub fn evaluate(
        &mut self,
        last_temp_ok_ms: Option<u64>,
        reading: &Reading,
        settings: &TemperatureSettings,
    ) -> SafetyVerdict {
        let now = reading.timestamp_ms;

        let stale = is_stale(last_temp_ok_ms, now, settings.sensor_timeout_ms());
        // A fitted secondary line that stops answering cannot vouch for the
        // chamber, so it locks the heaters like a primary failure.
        let sensor_failure = reading.temperature_f.is_none()
            || reading.humidity_pct.is_none()
            || reading.secondary_failed
            || stale;

        let overheat_triggered = reading
            .secondary_temperature_f
            .map_or(false, |t| t >= settings.safety_cutoff);

        let cutoff_triggered = reading
            .temperature_f
            .map_or(false, |t| t >= settings.safety_cutoff);

        let verdict = SafetyVerdict {
            sensor_failure,
            overheat_triggered,
            cutoff_triggered,
        };

        self.record_edges(verdict, reading);
        self.last_verdict = verdict;
        verdict
    }

    /// Failure flag for the humidity channel: absent this tick or stale
    /// beyond the sensor timeout.
    pub fn humidity_sensor_failure(
        &self,
        last_humidity_ok_ms: Option<u64>,
        reading: &Reading,
        settings: &TemperatureSettings,
    ) -> bool {
        reading.humidity_pct.is_none()
            || is_stale(last_humidity_ok_ms, reading.timestamp_ms, settings.sensor_timeout_ms())
    }

    fn record_edges(&mut self, verdict: SafetyVerdict, reading: &Reading) {
        let edges = [
            (SafetyEvent::SensorFailure, self.last_verdict.sensor_failure, verdict.sensor_failure),
            (SafetyEvent::Overheat, self.last_verdict.overheat_triggered, verdict.overheat_triggered),
            (SafetyEvent::Cutoff, self.last_verdict.cutoff_triggered, verdict.cutoff_triggered),
        ];

        for (event, was, is) in edges {
            if was == is {
                continue;
            }
            if is {
                self.trip_count = self.trip_count.saturating_add(1);
                warn!(
                    "safety trip: {} (temp={:?}F secondary={:?}F), heaters forced off",
                    event.describe(),
                    reading.temperature_f,
                    reading.secondary_temperature_f
                );
            } else {
                info!("safety cleared: {}", event.describe());
            }
            self.record_event(SafetyEventRecord {
                event,
                timestamp_ms: reading.timestamp_ms,
                tripped: is,
                temperature_f: reading.temperature_f,
            });
        }
    }

    fn record_event(&mut self, record: SafetyEventRecord) {
        // Ring buffer: oldest entry goes first.
        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(record);
    }

    pub fn last_verdict(&self) -> SafetyVerdict {
        self.last_verdict
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn trip_count(&self) -> u32 {
        self.trip_count
    }

    /// Forgets the previous verdict so the next evaluation logs fresh edges.
    /// History and counters are kept.
    pub fn reset(&mut self) {
        self.last_verdict = SafetyVerdict::default();
    }
}

fn is_stale(last_ok_ms: Option<u64>, now_ms: u64, timeout_ms: u64) -> bool {
    match last_ok_ms {
        Some(last) => now_ms.saturating_sub(last) > timeout_ms,
        None => true,
    }
}
