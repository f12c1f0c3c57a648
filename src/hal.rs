//! Hardware boundary.
//!
//! The engine never talks to the I2C bus or GPIO lines itself. It consumes
//! two capabilities, one for the combined temperature/humidity sensor and
//! one for the relay bank, so the same control code runs against real
//! hardware, the [`crate::sim`] incubator model, or test doubles.
//!
//! Both traits are synchronous and may block; callers run every call through
//! a [`BlockingSlot`] (see [`crate::sensor::SensorReader`] and
//! [`crate::relay::RelayPort`]).

use crate::relay::RelayId;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("device not connected")]
    NotConnected,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
    #[error("driver task aborted: {0}")]
    Aborted(String),
    #[error("previous call still in progress")]
    Busy,
}

/// Combined temperature/humidity sensor (SHT3x class).
pub trait SensorDriver: Send + Sync {
    /// Primary temperature in degrees Celsius.
    fn read_temperature_c(&self) -> Result<f32, DriverError>;

    /// Relative humidity in percent.
    fn read_humidity(&self) -> Result<f32, DriverError>;

    /// Independent over-temperature sense line, in degrees Celsius.
    ///
    /// Boards without a redundant sensor report `Ok(None)`.
    fn read_secondary_temperature_c(&self) -> Result<Option<f32>, DriverError> {
        Ok(None)
    }
}

/// Relay bank output. Writes are idempotent: setting a relay to the state
/// it already holds is harmless.
pub trait RelayDriver: Send + Sync {
    fn set(&self, relay: RelayId, on: bool) -> Result<(), DriverError>;
}

/// Slot for one blocking driver call at a time.
///
/// The call runs on the blocking pool under a hard deadline. A call that
/// overruns is reported as [`DriverError::Timeout`] and keeps the slot busy
/// until it returns on its own; until then further calls are refused with
/// [`DriverError::Busy`] instead of queueing more threads behind a hung bus.
/// A call that panics is reported as [`DriverError::Aborted`].
pub struct BlockingSlot<T> {
    pending: Option<JoinHandle<Result<T, DriverError>>>,
}

impl<T> Default for BlockingSlot<T> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<T: Send + 'static> BlockingSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while an overrun call is still running.
    pub fn is_busy(&self) -> bool {
        self.pending.as_ref().map_or(false, |task| !task.is_finished())
    }

    pub async fn call<F>(&mut self, deadline: Duration, call: F) -> Result<T, DriverError>
    where
        F: FnOnce() -> Result<T, DriverError> + Send + 'static,
    {
        if self.is_busy() {
            return Err(DriverError::Busy);
        }
        // A late result from an overrun call is stale; drop it.
        self.pending = None;

        let mut task = tokio::task::spawn_blocking(call);
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DriverError::Aborted(join_error.to_string())),
            Err(_) => {
                self.pending = Some(task);
                Err(DriverError::Timeout(deadline.as_millis() as u64))
            }
        }
    }
}

pub fn celsius_to_fahrenheit(c: f32) -> f32 {
    c * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(f: f32) -> f32 {
    (f - 32.0) * 5.0 / 9.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        assert!((celsius_to_fahrenheit(37.5) - 99.5).abs() < 1e-4);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 1e-4);
        assert!((fahrenheit_to_celsius(celsius_to_fahrenheit(-40.0)) + 40.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_slot_outcomes() {
        let mut slot = BlockingSlot::new();
        assert_eq!(slot.call(Duration::from_secs(1), || Ok(7u8)).await, Ok(7));

        let panicked = slot
            .call(Duration::from_secs(1), || -> Result<u8, DriverError> { panic!("driver bug") })
            .await;
        assert!(matches!(panicked, Err(DriverError::Aborted(_))));
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_overrun_call_keeps_slot_busy() {
        let mut slot = BlockingSlot::new();
        let slow = slot
            .call(Duration::from_millis(20), || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(1u8)
            })
            .await;
        assert_eq!(slow, Err(DriverError::Timeout(20)));
        assert!(slot.is_busy());

        // Refused without spawning while the first call still runs.
        assert_eq!(slot.call(Duration::from_secs(1), || Ok(2u8)).await, Err(DriverError::Busy));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!slot.is_busy());
        assert_eq!(slot.call(Duration::from_secs(1), || Ok(3u8)).await, Ok(3));
    }

    #[test]
    fn test_driver_error_display() {
        assert_eq!(DriverError::Timeout(2000).to_string(), "operation timed out after 2000 ms");
        assert_eq!(DriverError::Bus("nack".into()).to_string(), "bus error: nack");
        assert_eq!(DriverError::Busy.to_string(), "previous call still in progress");
    }
}
