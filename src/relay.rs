use crate::hal::{BlockingSlot, DriverError, RelayDriver};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Relays driven by the engine. The bank itself has eight channels; the
/// remaining five are left untouched.
pub const RELAY_COUNT: usize = 3;
pub const BANK_CHANNELS: usize = 8;

// Relay states are published as a u8 bitmask.
const_assert!(RELAY_COUNT <= BANK_CHANNELS);
const_assert!(BANK_CHANNELS <= 8);

pub type CommandList = Vec<RelayCommand, RELAY_COUNT>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayId {
    Heater1,
    Heater2,
    Humidifier,
}

impl RelayId {
    pub const ALL: [RelayId; RELAY_COUNT] = [RelayId::Heater1, RelayId::Heater2, RelayId::Humidifier];
    pub const HEATERS: [RelayId; 2] = [RelayId::Heater1, RelayId::Heater2];

    /// Channel index on the relay bank.
    pub fn channel(self) -> u8 {
        match self {
            RelayId::Heater1 => 0,
            RelayId::Heater2 => 1,
            RelayId::Humidifier => 2,
        }
    }

    pub fn mask(self) -> u8 {
        1 << self.channel()
    }

    pub fn name(self) -> &'static str {
        match self {
            RelayId::Heater1 => "Heater 1",
            RelayId::Heater2 => "Heater 2",
            RelayId::Humidifier => "Humidifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub relay: RelayId,
    pub on: bool,
}

/// Outcome of cycling one relay during the self-test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCheck {
    pub relay: RelayId,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub sent: u8,
    pub failed: u8,
}

/// Bounded write path to the relay bank, shared by the tick and by
/// out-of-band writes. Each relay has one call slot: a hung write holds at
/// most one blocking thread per relay, and writes to that relay fail with
/// `DriverError::Busy` until it returns.
#[derive(Clone)]
pub struct RelayPort {
    driver: Arc<dyn RelayDriver>,
    io_timeout: Duration,
    slots: Arc<[Mutex<BlockingSlot<()>>; RELAY_COUNT]>,
}

impl RelayPort {
    pub fn new(driver: Arc<dyn RelayDriver>, io_timeout: Duration) -> Self {
        Self {
            driver,
            io_timeout,
            slots: Arc::new([(); RELAY_COUNT].map(|_| Mutex::new(BlockingSlot::new()))),
        }
    }

    pub async fn write(&self, relay: RelayId, on: bool) -> Result<(), DriverError> {
        let mut slot = self.slots[relay.channel() as usize].lock().await;
        let driver = Arc::clone(&self.driver);
        slot.call(self.io_timeout, move || driver.set(relay, on)).await
    }

    /// True while a timed-out write to `relay` is still running.
    pub fn is_busy(&self, relay: RelayId) -> bool {
        self.slots[relay.channel() as usize]
            .try_lock()
            .map_or(true, |slot| slot.is_busy())
    }
}

/// Actuator side of the engine.
///
/// Tracks the last state commanded to each relay so controllers only emit
/// commands on change. A failed write forgets the relay's state, which makes
/// the next tick resend whatever the controllers want.
pub struct RelayBank {
    port: RelayPort,
    commanded: [Option<bool>; RELAY_COUNT],
    write_failures: u32,
}

impl RelayBank {
    pub fn new(port: RelayPort) -> Self {
        Self {
            port,
            commanded: [None; RELAY_COUNT],
            write_failures: 0,
        }
    }

    /// Commands needed to move the bank to `desired`. Relays whose state is
    /// unknown are always included.
    pub fn plan(&self, desired: &[RelayCommand]) -> CommandList {
        let mut commands = CommandList::new();
        for cmd in desired {
            if self.commanded[cmd.relay.channel() as usize] != Some(cmd.on) {
                // Capacity equals the relay count and each relay appears once.
                let _ = commands.push(*cmd);
            }
        }
        commands
    }

    /// Sends every command once. Driver failures and timeouts are logged and
    /// counted; a panicking driver is returned as an error so the caller can
    /// fall back to its safe state.
    pub async fn apply(&mut self, commands: &[RelayCommand]) -> Result<ApplyReport, DriverError> {
        let mut report = ApplyReport::default();
        let mut aborted = None;

        for cmd in commands {
            let slot = cmd.relay.channel() as usize;
            match self.port.write(cmd.relay, cmd.on).await {
                Ok(()) => {
                    debug!("{} -> {}", cmd.relay.name(), if cmd.on { "ON" } else { "OFF" });
                    self.commanded[slot] = Some(cmd.on);
                    report.sent += 1;
                }
                Err(e) => {
                    warn!("relay write failed for {}: {}", cmd.relay.name(), e);
                    self.commanded[slot] = None;
                    self.write_failures = self.write_failures.saturating_add(1);
                    report.failed += 1;
                    if matches!(e, DriverError::Aborted(_)) {
                        aborted = Some(e);
                    }
                }
            }
        }

        match aborted {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Plans and applies in one step.
    pub async fn drive(&mut self, desired: &[RelayCommand]) -> Result<ApplyReport, DriverError> {
        let commands = self.plan(desired);
        self.apply(&commands).await
    }

    /// Writes OFF to the given relays regardless of their tracked state.
    pub async fn force_off(&mut self, relays: &[RelayId]) -> ApplyReport {
        let commands: CommandList = relays
            .iter()
            .take(RELAY_COUNT)
            .map(|&relay| RelayCommand { relay, on: false })
            .collect();
        match self.apply(&commands).await {
            Ok(report) => report,
            Err(_) => ApplyReport {
                sent: 0,
                failed: commands.len() as u8,
            },
        }
    }

    pub async fn force_all_off(&mut self) -> ApplyReport {
        self.force_off(&RelayId::ALL).await
    }

    /// Drops all tracked state so the next plan resends every relay.
    pub fn invalidate(&mut self) {
        self.commanded = [None; RELAY_COUNT];
    }

    pub fn is_on(&self, relay: RelayId) -> bool {
        self.commanded[relay.channel() as usize] == Some(true)
    }

    /// Bitmask of relays last commanded ON (bit n = channel n).
    pub fn mask(&self) -> u8 {
        RelayId::ALL
            .iter()
            .filter(|&&relay| self.is_on(relay))
            .fold(0, |acc, relay| acc | relay.mask())
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<std::vec::Vec<(RelayId, bool)>>,
        fail: Mutex<Option<RelayId>>,
    }

    impl RelayDriver for Recorder {
        fn set(&self, relay: RelayId, on: bool) -> Result<(), DriverError> {
            if *self.fail.lock().unwrap() == Some(relay) {
                return Err(DriverError::Bus("stuck".into()));
            }
            self.writes.lock().unwrap().push((relay, on));
            Ok(())
        }
    }

    fn bank() -> (Arc<Recorder>, RelayBank) {
        let recorder = Arc::new(Recorder::default());
        let bank = RelayBank::new(RelayPort::new(recorder.clone(), Duration::from_secs(1)));
        (recorder, bank)
    }

    fn heaters(on: bool) -> [RelayCommand; 2] {
        [
            RelayCommand { relay: RelayId::Heater1, on },
            RelayCommand { relay: RelayId::Heater2, on },
        ]
    }

    #[test]
    fn test_relay_masks() {
        assert_eq!(RelayId::Heater1.mask(), 0b001);
        assert_eq!(RelayId::Heater2.mask(), 0b010);
        assert_eq!(RelayId::Humidifier.mask(), 0b100);
    }

    #[tokio::test]
    async fn test_unknown_state_is_always_sent() {
        let (recorder, mut bank) = bank();
        assert_eq!(bank.plan(&heaters(false)).len(), 2);

        bank.drive(&heaters(false)).await.unwrap();
        assert_eq!(recorder.writes.lock().unwrap().len(), 2);
        assert!(bank.plan(&heaters(false)).is_empty());
    }

    #[tokio::test]
    async fn test_only_changes_are_emitted() {
        let (recorder, mut bank) = bank();
        bank.drive(&heaters(true)).await.unwrap();
        bank.drive(&heaters(true)).await.unwrap();
        bank.drive(&heaters(true)).await.unwrap();

        assert_eq!(recorder.writes.lock().unwrap().len(), 2);
        assert_eq!(bank.mask(), 0b011);
    }

    #[tokio::test]
    async fn test_failed_write_is_resent_next_time() {
        let (recorder, mut bank) = bank();
        *recorder.fail.lock().unwrap() = Some(RelayId::Heater2);

        let report = bank.drive(&heaters(true)).await.unwrap();
        assert_eq!(report, ApplyReport { sent: 1, failed: 1 });
        assert_eq!(bank.write_failures(), 1);
        assert!(!bank.is_on(RelayId::Heater2));

        *recorder.fail.lock().unwrap() = None;
        let commands = bank.plan(&heaters(true));
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].relay, RelayId::Heater2);
    }

    #[tokio::test]
    async fn test_force_all_off_ignores_tracked_state() {
        let (recorder, mut bank) = bank();
        bank.drive(&heaters(false)).await.unwrap();
        recorder.writes.lock().unwrap().clear();

        let report = bank.force_all_off().await;
        assert_eq!(report.sent, 3);
        assert_eq!(bank.mask(), 0);
        assert_eq!(recorder.writes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_hung_relay_holds_one_thread() {
        struct HungRelay {
            calls: std::sync::atomic::AtomicU32,
        }

        impl RelayDriver for HungRelay {
            fn set(&self, relay: RelayId, _on: bool) -> Result<(), DriverError> {
                if relay == RelayId::Heater1 {
                    self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(400));
                }
                Ok(())
            }
        }

        let driver = Arc::new(HungRelay {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let port = RelayPort::new(driver.clone(), Duration::from_millis(20));

        assert!(matches!(port.write(RelayId::Heater1, true).await, Err(DriverError::Timeout(_))));
        assert!(port.is_busy(RelayId::Heater1));
        assert!(matches!(port.write(RelayId::Heater1, false).await, Err(DriverError::Busy)));
        // Other relays keep their own slot.
        assert!(port.write(RelayId::Heater2, true).await.is_ok());
        assert_eq!(driver.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!port.is_busy(RelayId::Heater1));
        assert!(port.write(RelayId::Heater1, false).await.is_ok());
    }
}
