//! # Incubator Environmental Control Engine
//!
//! Regulates temperature and humidity inside an egg incubator: reads a
//! combined temperature/humidity sensor, drives two heaters and a humidifier
//! through a relay bank, and enforces hard safety limits against overheating
//! and sensor loss.
//!
//! ## Features
//!
//! - **Hysteresis control**: paired heaters and a humidifier, each with a
//!   min/target/max band
//! - **Layered interlocks**: sensor failure and staleness, a secondary
//!   over-temperature line, and a primary safety cutoff
//! - **Bounded I/O**: every driver call runs under a deadline; a hung bus
//!   never stalls the loop
//! - **Durable settings**: validated as a whole, swapped atomically, written
//!   to JSON
//! - **Line protocol**: JSON over TCP for status, settings, control and a
//!   live status stream
//!
//! ## Quick Start
//!
//! ```no_run
//! use incubator::{ControlLoop, SettingsStore, SimConfig, SimulatedIncubator, Target};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let chamber = Arc::new(SimulatedIncubator::new(SimConfig::default()));
//! let settings = Arc::new(SettingsStore::open("settings.json"));
//! let control = ControlLoop::new(chamber.clone(), chamber, settings, Duration::from_secs(2));
//!
//! control.start(Target::All).await.ok();
//! let status = control.tick().await;
//! println!("{}", status.summary());
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`hal`] - sensor and relay driver capabilities
//! - [`sensor`] / [`relay`] - bounded reads and change-only relay writes
//! - [`safety`] - per-tick heater interlock verdict
//! - [`subsystems`] - temperature and humidity controllers
//! - [`control_loop`] - tick scheduler and imperative operations
//! - [`protocol`] / [`server`] - line-delimited JSON API
//! - [`sim`] / [`linux`] - simulated chamber and sysfs hardware drivers

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod control_loop;
pub mod hal;
pub mod linux;
pub mod protocol;
pub mod relay;
pub mod safety;
pub mod sensor;
pub mod server;
pub mod settings;
pub mod sim;
pub mod status;
pub mod subsystems;

// Re-export main public types for convenience
pub use config::DaemonConfig;
pub use control_loop::{ControlError, ControlLoop};
pub use hal::{DriverError, RelayDriver, SensorDriver};
pub use protocol::{Command, Request, Response};
pub use relay::RelayId;
pub use settings::{Settings, SettingsStore, SettingsUpdate};
pub use sim::{SimConfig, SimulatedIncubator};
pub use status::Status;
pub use subsystems::{Action, Target};
