use crate::hal::{celsius_to_fahrenheit, BlockingSlot, DriverError, SensorDriver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Physically plausible primary temperature band (°F).
pub const TEMP_PLAUSIBLE_MIN_F: f32 = -40.0;
pub const TEMP_PLAUSIBLE_MAX_F: f32 = 200.0;
/// Physically plausible relative humidity band (%).
pub const HUMIDITY_PLAUSIBLE_MIN: f32 = 0.0;
pub const HUMIDITY_PLAUSIBLE_MAX: f32 = 100.0;

/// One sensor sample. An absent field means that channel failed this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature_f: Option<f32>,
    pub humidity_pct: Option<f32>,
    /// Independent over-temperature sense line, if the board has one. Not
    /// range-filtered: any finite value is reported as read.
    pub secondary_temperature_f: Option<f32>,
    /// The fitted secondary line failed or returned a non-finite value.
    #[serde(default)]
    pub secondary_failed: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub reads: u32,
    pub temperature_failures: u32,
    pub humidity_failures: u32,
    pub secondary_failures: u32,
    /// Calls that overran the deadline or found the previous call still hung.
    pub timeouts: u32,
}

/// Bounded reads of the combined sensor. Each channel has its own call slot,
/// so a hung bus holds at most one blocking thread per channel.
pub struct SensorReader {
    driver: Arc<dyn SensorDriver>,
    io_timeout: Duration,
    temperature_slot: BlockingSlot<f32>,
    humidity_slot: BlockingSlot<f32>,
    secondary_slot: BlockingSlot<Option<f32>>,
    last_temperature_ok_ms: Option<u64>,
    last_humidity_ok_ms: Option<u64>,
    stats: ReadStats,
}

impl SensorReader {
    pub fn new(driver: Arc<dyn SensorDriver>, io_timeout: Duration) -> Self {
        Self {
            driver,
            io_timeout,
            temperature_slot: BlockingSlot::new(),
            humidity_slot: BlockingSlot::new(),
            secondary_slot: BlockingSlot::new(),
            last_temperature_ok_ms: None,
            last_humidity_ok_ms: None,
            stats: ReadStats::default(),
        }
    }

    /// Samples every channel once. Never fails: a driver error, a timeout
    /// or an implausible value leaves the channel absent.
    pub async fn read(&mut self, now_ms: u64) -> Reading {
        self.stats.reads = self.stats.reads.saturating_add(1);

        let driver = Arc::clone(&self.driver);
        let result = self
            .temperature_slot
            .call(self.io_timeout, move || driver.read_temperature_c())
            .await;
        let temperature = settle(&mut self.stats, "temperature", result)
            .map(celsius_to_fahrenheit)
            .and_then(|f| plausible(f, TEMP_PLAUSIBLE_MIN_F, TEMP_PLAUSIBLE_MAX_F, "temperature"));

        let driver = Arc::clone(&self.driver);
        let result = self
            .humidity_slot
            .call(self.io_timeout, move || driver.read_humidity())
            .await;
        let humidity = settle(&mut self.stats, "humidity", result)
            .and_then(|h| plausible(h, HUMIDITY_PLAUSIBLE_MIN, HUMIDITY_PLAUSIBLE_MAX, "humidity"));

        let driver = Arc::clone(&self.driver);
        let result = self
            .secondary_slot
            .call(self.io_timeout, move || driver.read_secondary_temperature_c())
            .await;
        let (secondary, secondary_failed) = match settle(&mut self.stats, "secondary temperature", result) {
            // No secondary line fitted.
            Some(None) => (None, false),
            Some(Some(c)) if c.is_finite() => (Some(celsius_to_fahrenheit(c)), false),
            Some(Some(c)) => {
                warn!("secondary temperature value {} is not finite", c);
                (None, true)
            }
            None => (None, true),
        };
        if secondary_failed {
            self.stats.secondary_failures = self.stats.secondary_failures.saturating_add(1);
        }

        if temperature.is_some() {
            self.last_temperature_ok_ms = Some(now_ms);
        } else {
            self.stats.temperature_failures = self.stats.temperature_failures.saturating_add(1);
        }
        if humidity.is_some() {
            self.last_humidity_ok_ms = Some(now_ms);
        } else {
            self.stats.humidity_failures = self.stats.humidity_failures.saturating_add(1);
        }

        debug!(
            "reading: temp={:?}F humidity={:?}% secondary={:?}F",
            temperature, humidity, secondary
        );

        Reading {
            temperature_f: temperature,
            humidity_pct: humidity,
            secondary_temperature_f: secondary,
            secondary_failed,
            timestamp_ms: now_ms,
        }
    }

    /// Timestamp of the last tick with a valid primary temperature.
    pub fn last_temperature_ok_ms(&self) -> Option<u64> {
        self.last_temperature_ok_ms
    }

    pub fn last_humidity_ok_ms(&self) -> Option<u64> {
        self.last_humidity_ok_ms
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }
}

fn settle<T>(stats: &mut ReadStats, channel: &str, result: Result<T, DriverError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            if matches!(e, DriverError::Timeout(_) | DriverError::Busy) {
                stats.timeouts = stats.timeouts.saturating_add(1);
            }
            warn!("{} read failed: {}", channel, e);
            None
        }
    }
}

fn plausible(value: f32, min: f32, max: f32, channel: &str) -> Option<f32> {
    if value.is_finite() && (min..=max).contains(&value) {
        Some(value)
    } else {
        warn!("{} value {} outside plausible range {}..{}", channel, value, min, max);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedSensor {
        temp_c: Mutex<Result<f32, DriverError>>,
        humidity: Mutex<Result<f32, DriverError>>,
        secondary_c: Mutex<Result<Option<f32>, DriverError>>,
    }

    impl FixedSensor {
        fn new(temp_c: f32, humidity: f32) -> Self {
            Self {
                temp_c: Mutex::new(Ok(temp_c)),
                humidity: Mutex::new(Ok(humidity)),
                secondary_c: Mutex::new(Ok(None)),
            }
        }
    }

    impl SensorDriver for FixedSensor {
        fn read_temperature_c(&self) -> Result<f32, DriverError> {
            self.temp_c.lock().unwrap().clone()
        }

        fn read_humidity(&self) -> Result<f32, DriverError> {
            self.humidity.lock().unwrap().clone()
        }

        fn read_secondary_temperature_c(&self) -> Result<Option<f32>, DriverError> {
            self.secondary_c.lock().unwrap().clone()
        }
    }

    fn reader(sensor: FixedSensor) -> (Arc<FixedSensor>, SensorReader) {
        let sensor = Arc::new(sensor);
        let reader = SensorReader::new(sensor.clone(), Duration::from_secs(1));
        (sensor, reader)
    }

    #[tokio::test]
    async fn test_valid_reading_is_converted() {
        let (_, mut reader) = reader(FixedSensor::new(37.5, 58.0));
        let reading = reader.read(1_000).await;

        let temp = reading.temperature_f.unwrap();
        assert!((temp - 99.5).abs() < 1e-3);
        assert_eq!(reading.humidity_pct, Some(58.0));
        assert_eq!(reading.secondary_temperature_f, None);
        assert_eq!(reading.timestamp_ms, 1_000);
        assert_eq!(reader.last_temperature_ok_ms(), Some(1_000));
        assert_eq!(reader.last_humidity_ok_ms(), Some(1_000));
    }

    #[tokio::test]
    async fn test_implausible_values_are_absent_not_clamped() {
        // 100 °C = 212 °F, above the plausible band.
        let (_, mut reader) = reader(FixedSensor::new(100.0, 140.0));
        let reading = reader.read(1_000).await;

        assert_eq!(reading.temperature_f, None);
        assert_eq!(reading.humidity_pct, None);
        assert_eq!(reader.last_temperature_ok_ms(), None);
        assert_eq!(reader.stats().temperature_failures, 1);
        assert_eq!(reader.stats().humidity_failures, 1);
    }

    #[tokio::test]
    async fn test_last_success_survives_failed_reads() {
        let (sensor, mut reader) = reader(FixedSensor::new(37.7, 60.0));
        reader.read(1_000).await;

        *sensor.temp_c.lock().unwrap() = Err(DriverError::Bus("crc mismatch".into()));
        let reading = reader.read(6_000).await;

        assert_eq!(reading.temperature_f, None);
        assert_eq!(reading.humidity_pct, Some(60.0));
        assert_eq!(reader.last_temperature_ok_ms(), Some(1_000));
        assert_eq!(reader.last_humidity_ok_ms(), Some(6_000));
    }

    #[tokio::test]
    async fn test_secondary_channel_is_reported() {
        let sensor = FixedSensor::new(37.7, 60.0);
        *sensor.secondary_c.lock().unwrap() = Ok(Some(38.5));
        let (_, mut reader) = reader(sensor);

        let reading = reader.read(0).await;
        let secondary = reading.secondary_temperature_f.unwrap();
        assert!((secondary - 101.3).abs() < 1e-3);
        assert!(!reading.secondary_failed);
    }

    #[tokio::test]
    async fn test_secondary_above_primary_band_is_kept() {
        // 96 °C = 204.8 °F, outside the primary band but a real overheat.
        let (sensor, mut reader) = reader(FixedSensor::new(37.7, 60.0));
        *sensor.secondary_c.lock().unwrap() = Ok(Some(96.0));

        let reading = reader.read(0).await;
        let secondary = reading.secondary_temperature_f.unwrap();
        assert!((secondary - 204.8).abs() < 1e-3);
        assert!(!reading.secondary_failed);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_flagged() {
        let (sensor, mut reader) = reader(FixedSensor::new(37.7, 60.0));
        *sensor.secondary_c.lock().unwrap() = Ok(Some(f32::NAN));
        let reading = reader.read(0).await;
        assert_eq!(reading.secondary_temperature_f, None);
        assert!(reading.secondary_failed);

        *sensor.secondary_c.lock().unwrap() = Err(DriverError::Bus("nack".into()));
        let reading = reader.read(5_000).await;
        assert!(reading.secondary_failed);
        assert_eq!(reader.stats().secondary_failures, 2);

        // No line fitted is not a failure.
        *sensor.secondary_c.lock().unwrap() = Ok(None);
        assert!(!reader.read(10_000).await.secondary_failed);
    }

    #[tokio::test]
    async fn test_hung_channel_is_not_called_again_while_busy() {
        struct SlowSensor {
            calls: std::sync::atomic::AtomicU32,
        }

        impl SensorDriver for SlowSensor {
            fn read_temperature_c(&self) -> Result<f32, DriverError> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                Ok(37.7)
            }

            fn read_humidity(&self) -> Result<f32, DriverError> {
                Ok(60.0)
            }
        }

        let sensor = Arc::new(SlowSensor {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let mut reader = SensorReader::new(sensor.clone(), Duration::from_millis(20));

        for now in 0..3 {
            let reading = reader.read(now).await;
            assert_eq!(reading.temperature_f, None);
            assert_eq!(reading.humidity_pct, Some(60.0));
        }
        assert_eq!(sensor.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(reader.stats().timeouts, 3);
    }
}
