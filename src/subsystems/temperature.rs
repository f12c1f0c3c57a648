use super::{band_decision, Controller, SubsystemId};
use crate::settings::TemperatureSettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureState {
    #[default]
    Idle,
    Heating,
    /// Cooling-wait after an interlock: heaters stay off until the
    /// temperature falls below `min`.
    Coasting,
    SafetyLocked,
}

impl TemperatureState {
    pub fn heaters_on(self) -> bool {
        self == TemperatureState::Heating
    }
}

/// Drives heater 1 and heater 2 as a pair.
#[derive(Debug, Default)]
pub struct TemperatureController {
    state: TemperatureState,
}

impl TemperatureController {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_state(
        &self,
        temperature: Option<f32>,
        settings: &TemperatureSettings,
        interlocked: bool,
    ) -> TemperatureState {
        if !settings.enabled {
            return TemperatureState::Idle;
        }
        let temp = match temperature {
            Some(t) if !interlocked => t,
            _ => return TemperatureState::SafetyLocked,
        };

        match band_decision(temp, settings.min, settings.max) {
            Some(true) => TemperatureState::Heating,
            Some(false) => TemperatureState::Idle,
            None => match self.state {
                TemperatureState::SafetyLocked | TemperatureState::Coasting => {
                    TemperatureState::Coasting
                }
                held => held,
            },
        }
    }
}

impl Controller for TemperatureController {
    type Settings = TemperatureSettings;
    type State = TemperatureState;

    fn id(&self) -> SubsystemId {
        SubsystemId::Temperature
    }

    /// A missing temperature is always treated as an interlock.
    fn step(
        &mut self,
        temperature: Option<f32>,
        settings: &TemperatureSettings,
        interlocked: bool,
    ) -> TemperatureState {
        let next = self.next_state(temperature, settings, interlocked);
        if next != self.state {
            info!(
                "temperature: {:?} -> {:?} at {:?}F (band {}..{})",
                self.state, next, temperature, settings.min, settings.max
            );
        } else {
            debug!("temperature: holding {:?} at {:?}F", next, temperature);
        }
        self.state = next;
        next
    }

    fn state(&self) -> TemperatureState {
        self.state
    }

    fn actuator_on(&self) -> bool {
        self.state.heaters_on()
    }

    fn reset(&mut self) {
        self.state = TemperatureState::Idle;
    }
}
