//! Line-delimited JSON protocol spoken by the daemon.
//!
//! One request per line, one response per line. Example:
//!
//! ```text
//! {"id":1,"command":"GetStatus"}
//! {"id":2,"command":{"Control":{"target":"temperature","action":"start"}}}
//! {"id":3,"command":{"ApplySettings":{"update":{"humidity":{"target":58.0}}}}}
//! {"id":4,"command":{"TestRelays":{}}}
//! ```

use crate::control_loop::{ControlError, ControlLoop, RELAY_TEST_OFF, RELAY_TEST_ON};
use crate::settings::{SettingsError, SettingsUpdate};
use crate::sim::SimFault;
use crate::status::Status;
use crate::subsystems::{Action, Target};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_REQUEST_SIZE: usize = 4096;
pub const MAX_RESPONSE_SIZE: usize = 8192;

pub type RequestBuffer = ArrayString<MAX_REQUEST_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub command: Command,
}

impl Request {
    pub fn new(id: u32, command: Command) -> Self {
        Self { id, command }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    GetStatus,
    GetSettings,
    ApplySettings { update: SettingsUpdate },
    Control { target: Target, action: Action },
    Reset,
    /// The connection then receives every published status.
    Subscribe,
    GetSafetyEvents,
    /// Only accepted when the daemon runs the simulated chamber.
    SimulateFault { fault: SimFault },
    ClearFaults,
    /// Relay and sensor self-tests; refused while a subsystem is enabled.
    TestRelays {
        #[serde(default = "default_relay_on_ms")]
        on_ms: u64,
        #[serde(default = "default_relay_off_ms")]
        off_ms: u64,
    },
    TestSensor {
        #[serde(default = "default_sensor_samples")]
        samples: u32,
        #[serde(default = "default_sensor_interval_ms")]
        interval_ms: u64,
    },
}

fn default_relay_on_ms() -> u64 {
    RELAY_TEST_ON.as_millis() as u64
}

fn default_relay_off_ms() -> u64 {
    RELAY_TEST_OFF.as_millis() as u64
}

fn default_sensor_samples() -> u32 {
    5
}

fn default_sensor_interval_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Rejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(id: u32, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            message: None,
            data,
        }
    }

    pub fn rejected(id: u32, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Rejected,
            message: Some(reason.into()),
            data: None,
        }
    }

    pub fn error(id: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Status pushed to a subscribed connection.
    pub fn status_update(id: u32, status: &Status) -> Result<Self, ProtocolError> {
        Ok(Self::ok(id, Some(to_value(status)?)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Outcome of one request line.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub response: Response,
    /// Set when the client asked to subscribe to status updates.
    pub subscribe: bool,
}

/// Per-connection request parser and response encoder.
#[derive(Debug)]
pub struct ProtocolHandler {
    request_buffer: RequestBuffer,
    response_buffer: ResponseBuffer,
    requests_handled: u32,
    errors: u32,
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            requests_handled: 0,
            errors: 0,
        }
    }

    pub fn parse_request(&mut self, line: &str) -> Result<Request, ProtocolError> {
        self.request_buffer.clear();
        let line = line.trim();
        self.request_buffer
            .try_push_str(line)
            .map_err(|_| ProtocolError::MessageTooLarge {
                size: line.len(),
                limit: MAX_REQUEST_SIZE,
            })?;

        serde_json::from_str::<Request>(&self.request_buffer)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn serialize_response(&mut self, response: &Response) -> Result<&str, ProtocolError> {
        self.response_buffer.clear();
        let json = serde_json::to_string(response).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.response_buffer
            .try_push_str(&json)
            .map_err(|_| ProtocolError::MessageTooLarge {
                size: json.len(),
                limit: MAX_RESPONSE_SIZE,
            })?;
        Ok(&self.response_buffer)
    }

    /// Parses and executes one line. Malformed or oversized input yields an
    /// error response; the connection stays usable.
    pub async fn handle_line(&mut self, control: &ControlLoop, line: &str) -> Handled {
        self.requests_handled = self.requests_handled.saturating_add(1);
        let request = match self.parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                self.errors = self.errors.saturating_add(1);
                warn!("bad request: {}", e);
                return Handled {
                    response: Response::error(0, e.to_string()),
                    subscribe: false,
                };
            }
        };

        debug!("request {}: {:?}", request.id, request.command);
        let subscribe = request.command == Command::Subscribe;
        let response = dispatch(control, request).await;
        if response.status != ResponseStatus::Ok {
            self.errors = self.errors.saturating_add(1);
        }
        Handled { response, subscribe }
    }

    pub fn requests_handled(&self) -> u32 {
        self.requests_handled
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}

/// Executes a request against the control loop.
pub async fn dispatch(control: &ControlLoop, request: Request) -> Response {
    let id = request.id;
    let result = match request.command {
        Command::GetStatus => to_value(&control.get_status()).map(Some),
        Command::GetSettings => to_value(&control.get_settings().await).map(Some),
        Command::ApplySettings { update } => match control.apply_settings(&update).await {
            Ok(settings) => to_value(&settings).map(Some),
            Err(e) => return control_error_response(id, e),
        },
        Command::Control { target, action } => match control.control(target, action).await {
            Ok(settings) => to_value(&settings).map(Some),
            Err(e) => return control_error_response(id, e),
        },
        Command::Reset => match control.reset().await {
            Ok(settings) => to_value(&settings).map(Some),
            Err(e) => return control_error_response(id, e),
        },
        Command::Subscribe => to_value(&control.get_status()).map(Some),
        Command::GetSafetyEvents => to_value(&control.safety_events().await).map(Some),
        Command::SimulateFault { fault } => match control.inject_fault(fault) {
            Ok(()) => Ok(None),
            Err(e) => return control_error_response(id, e),
        },
        Command::ClearFaults => match control.clear_faults() {
            Ok(()) => Ok(None),
            Err(e) => return control_error_response(id, e),
        },
        Command::TestRelays { on_ms, off_ms } => {
            let on = Duration::from_millis(on_ms);
            let off = Duration::from_millis(off_ms);
            match control.test_relays(on, off).await {
                Ok(checks) => to_value(&checks).map(Some),
                Err(e) => return control_error_response(id, e),
            }
        }
        Command::TestSensor { samples, interval_ms } => {
            match control.test_sensor(samples, Duration::from_millis(interval_ms)).await {
                Ok(readings) => to_value(&readings).map(Some),
                Err(e) => return control_error_response(id, e),
            }
        }
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(e) => Response::error(id, e.to_string()),
    }
}

fn control_error_response(id: u32, error: ControlError) -> Response {
    match error {
        ControlError::Settings(SettingsError::Rejected(reason)) | ControlError::Refused(reason) => {
            Response::rejected(id, reason)
        }
        other => Response::error(id, other.to_string()),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_and_struct_commands() {
        let mut handler = ProtocolHandler::new();

        let request = handler.parse_request(r#"{"id":1,"command":"GetStatus"}"#).unwrap();
        assert_eq!(request, Request::new(1, Command::GetStatus));

        let request = handler
            .parse_request(r#"{"id":2,"command":{"Control":{"target":"humidity","action":"stop"}}}"#)
            .unwrap();
        assert_eq!(
            request.command,
            Command::Control {
                target: Target::Humidity,
                action: Action::Stop
            }
        );
    }

    #[test]
    fn test_self_test_commands_take_default_timings() {
        let mut handler = ProtocolHandler::new();

        let request = handler.parse_request(r#"{"id":3,"command":{"TestRelays":{}}}"#).unwrap();
        assert_eq!(request.command, Command::TestRelays { on_ms: 1_000, off_ms: 500 });

        let request = handler
            .parse_request(r#"{"id":4,"command":{"TestSensor":{"samples":2}}}"#)
            .unwrap();
        assert_eq!(request.command, Command::TestSensor { samples: 2, interval_ms: 2_000 });

        let request = handler
            .parse_request(r#"{"id":5,"command":{"SimulateFault":{"fault":{"StuckRelay":{"relay":"heater2"}}}}}"#)
            .unwrap();
        assert_eq!(
            request.command,
            Command::SimulateFault {
                fault: SimFault::StuckRelay { relay: crate::relay::RelayId::Heater2 }
            }
        );
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut handler = ProtocolHandler::new();
        let line = format!(r#"{{"id":1,"command":"GetStatus","pad":"{}"}}"#, "x".repeat(MAX_REQUEST_SIZE));
        assert!(matches!(
            handler.parse_request(&line),
            Err(ProtocolError::MessageTooLarge { limit: MAX_REQUEST_SIZE, .. })
        ));
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let mut handler = ProtocolHandler::new();
        let json = handler.serialize_response(&Response::ok(7, None)).unwrap();
        assert_eq!(json, r#"{"id":7,"status":"Ok"}"#);

        let json = handler
            .serialize_response(&Response::rejected(8, "min must be below max"))
            .unwrap()
            .to_string();
        assert!(json.contains(r#""status":"Rejected""#));
        assert!(json.contains("min must be below max"));
    }
}
