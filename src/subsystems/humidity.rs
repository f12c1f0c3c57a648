use super::{band_decision, Controller, SubsystemId};
use crate::settings::HumiditySettings;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HumidityState {
    #[default]
    Idle,
    Humidifying,
}

#[derive(Debug, Default)]
pub struct HumidityController {
    state: HumidityState,
}

impl HumidityController {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for HumidityController {
    type Settings = HumiditySettings;
    type State = HumidityState;

    fn id(&self) -> SubsystemId {
        SubsystemId::Humidity
    }

    /// `interlocked` is the humidity channel failure flag.
    fn step(
        &mut self,
        humidity: Option<f32>,
        settings: &HumiditySettings,
        interlocked: bool,
    ) -> HumidityState {
        let next = match humidity {
            _ if !settings.enabled => HumidityState::Idle,
            Some(h) if !interlocked => match band_decision(h, settings.min, settings.max) {
                Some(true) => HumidityState::Humidifying,
                Some(false) => HumidityState::Idle,
                None => self.state,
            },
            _ => HumidityState::Idle,
        };

        if next != self.state {
            info!("humidity: {:?} -> {:?} at {:?}%", self.state, next, humidity);
        }
        self.state = next;
        next
    }

    fn state(&self) -> HumidityState {
        self.state
    }

    fn actuator_on(&self) -> bool {
        self.state == HumidityState::Humidifying
    }

    fn reset(&mut self) {
        self.state = HumidityState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayId;

    fn enabled() -> HumiditySettings {
        HumiditySettings {
            enabled: true,
            ..HumiditySettings::default()
        }
    }

    #[test]
    fn test_band_scenario() {
        let settings = enabled();
        let mut controller = HumidityController::new();

        let states: Vec<_> = [50.0, 58.0, 66.0, 61.0]
            .iter()
            .map(|&h| controller.step(Some(h), &settings, false))
            .collect();

        assert_eq!(
            states,
            vec![
                HumidityState::Humidifying,
                HumidityState::Humidifying,
                HumidityState::Idle,
                HumidityState::Idle,
            ]
        );
    }

    #[test]
    fn test_channel_failure_forces_idle() {
        let settings = enabled();
        let mut controller = HumidityController::new();
        controller.step(Some(40.0), &settings, false);
        assert!(controller.actuator_on());

        assert_eq!(controller.step(None, &settings, false), HumidityState::Idle);
        controller.step(Some(40.0), &settings, false);
        assert_eq!(controller.step(Some(40.0), &settings, true), HumidityState::Idle);
    }

    #[test]
    fn test_disabled_is_idle() {
        let mut controller = HumidityController::new();
        assert_eq!(
            controller.step(Some(10.0), &HumiditySettings::default(), false),
            HumidityState::Idle
        );
    }

    #[test]
    fn test_single_relay_command() {
        let mut controller = HumidityController::new();
        controller.step(Some(50.0), &enabled(), false);
        let commands = controller.relay_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].relay, RelayId::Humidifier);
        assert!(commands[0].on);
    }
}
