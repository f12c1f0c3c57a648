pub mod humidity;
pub mod temperature;

pub use humidity::{HumidityController, HumidityState};
pub use temperature::{TemperatureController, TemperatureState};

use crate::relay::{CommandList, RelayCommand, RelayId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemId {
    Temperature,
    Humidity,
}

impl SubsystemId {
    pub fn relays(self) -> &'static [RelayId] {
        match self {
            SubsystemId::Temperature => &RelayId::HEATERS,
            SubsystemId::Humidity => &[RelayId::Humidifier],
        }
    }
}

/// Subsystem selector for start/stop requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Temperature,
    Humidity,
    All,
}

impl Target {
    pub fn subsystems(self) -> &'static [SubsystemId] {
        match self {
            Target::Temperature => &[SubsystemId::Temperature],
            Target::Humidity => &[SubsystemId::Humidity],
            Target::All => &[SubsystemId::Temperature, SubsystemId::Humidity],
        }
    }

    pub fn includes(self, id: SubsystemId) -> bool {
        self.subsystems().contains(&id)
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(Target::Temperature),
            "humidity" => Ok(Target::Humidity),
            "all" => Ok(Target::All),
            other => Err(format!("unknown target '{}'", other)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Target::Temperature => "temperature",
            Target::Humidity => "humidity",
            Target::All => "all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// A hysteresis controller driving one group of relays.
///
/// `step` is the only place the state changes. `interlocked` forces the
/// actuators off regardless of the measurement.
pub trait Controller {
    type Settings;
    type State: Copy + PartialEq + Serialize;

    fn id(&self) -> SubsystemId;
    fn step(
        &mut self,
        measurement: Option<f32>,
        settings: &Self::Settings,
        interlocked: bool,
    ) -> Self::State;
    fn state(&self) -> Self::State;
    fn actuator_on(&self) -> bool;
    fn reset(&mut self);

    /// Desired state of every relay this controller owns.
    fn relay_commands(&self) -> CommandList {
        let on = self.actuator_on();
        self.id()
            .relays()
            .iter()
            .map(|&relay| RelayCommand { relay, on })
            .collect()
    }
}

/// Shared hysteresis band check. `None` means "inside the band, keep the
/// previous decision".
pub(crate) fn band_decision(value: f32, min: f32, max: f32) -> Option<bool> {
    if value < min {
        Some(true)
    } else if value >= max {
        Some(false)
    } else {
        None
    }
}
