//! Controller settings: validation, partial updates, atomic swap and the
//! durable settings record.
//!
//! Settings are only ever replaced as a whole. An update is merged onto a
//! copy of the current settings, the merged copy is validated, and only then
//! is it swapped in and written to disk. A rejected update leaves both the
//! in-memory and the persisted settings untouched.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Lower bound on the sensor staleness timeout.
pub const MIN_SENSOR_TIMEOUT_S: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings rejected: {0}")]
    Rejected(String),
    #[error("failed to persist settings to {path}: {reason}")]
    Persist { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSettings {
    pub target: f32,
    pub min: f32,
    pub max: f32,
    pub safety_cutoff: f32,
    #[serde(alias = "sensor_timeout")]
    pub sensor_timeout_s: u32,
    pub enabled: bool,
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            target: 99.8,
            min: 99.6,
            max: 100.2,
            safety_cutoff: 100.3,
            sensor_timeout_s: 30,
            enabled: false,
        }
    }
}

impl TemperatureSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !strictly_below(self.min, self.target) {
            return Err(reject(format!("temperature min {} must be below target {}", self.min, self.target)));
        }
        if !strictly_below(self.target, self.max) {
            return Err(reject(format!("temperature target {} must be below max {}", self.target, self.max)));
        }
        if !strictly_below(self.max, self.safety_cutoff) {
            return Err(reject(format!(
                "temperature max {} must be below safety cutoff {}",
                self.max, self.safety_cutoff
            )));
        }
        if !self.safety_cutoff.is_finite() || !self.min.is_finite() {
            return Err(reject("temperature thresholds must be finite".into()));
        }
        if self.sensor_timeout_s < MIN_SENSOR_TIMEOUT_S {
            return Err(reject(format!(
                "sensor timeout {}s is below the {}s minimum",
                self.sensor_timeout_s, MIN_SENSOR_TIMEOUT_S
            )));
        }
        Ok(())
    }

    pub fn sensor_timeout_ms(&self) -> u64 {
        u64::from(self.sensor_timeout_s) * 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HumiditySettings {
    pub target: f32,
    pub min: f32,
    pub max: f32,
    pub enabled: bool,
}

impl Default for HumiditySettings {
    fn default() -> Self {
        Self {
            target: 60.0,
            min: 55.0,
            max: 65.0,
            enabled: false,
        }
    }
}

impl HumiditySettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !strictly_below(self.min, self.target) {
            return Err(reject(format!("humidity min {} must be below target {}", self.min, self.target)));
        }
        if !strictly_below(self.target, self.max) {
            return Err(reject(format!("humidity target {} must be below max {}", self.target, self.max)));
        }
        if self.min < 0.0 || self.max > 100.0 {
            return Err(reject(format!(
                "humidity band {}..{} must lie within 0..100",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub temperature: TemperatureSettings,
    pub humidity: HumiditySettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.temperature.validate()?;
        self.humidity.validate()
    }

    /// Returns the merged settings without touching `self`.
    pub fn merged(&self, update: &SettingsUpdate) -> Settings {
        let mut merged = *self;
        if let Some(patch) = &update.temperature {
            patch.apply_to(&mut merged.temperature);
        }
        if let Some(patch) = &update.humidity {
            patch.apply_to(&mut merged.humidity);
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperaturePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_cutoff: Option<f32>,
    #[serde(default, alias = "sensor_timeout", skip_serializing_if = "Option::is_none")]
    pub sensor_timeout_s: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl TemperaturePatch {
    fn apply_to(&self, settings: &mut TemperatureSettings) {
        if let Some(v) = self.target {
            settings.target = v;
        }
        if let Some(v) = self.min {
            settings.min = v;
        }
        if let Some(v) = self.max {
            settings.max = v;
        }
        if let Some(v) = self.safety_cutoff {
            settings.safety_cutoff = v;
        }
        if let Some(v) = self.sensor_timeout_s {
            settings.sensor_timeout_s = v;
        }
        if let Some(v) = self.enabled {
            settings.enabled = v;
        }
    }
}

impl From<TemperatureSettings> for TemperaturePatch {
    fn from(s: TemperatureSettings) -> Self {
        Self {
            target: Some(s.target),
            min: Some(s.min),
            max: Some(s.max),
            safety_cutoff: Some(s.safety_cutoff),
            sensor_timeout_s: Some(s.sensor_timeout_s),
            enabled: Some(s.enabled),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HumidityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl HumidityPatch {
    fn apply_to(&self, settings: &mut HumiditySettings) {
        if let Some(v) = self.target {
            settings.target = v;
        }
        if let Some(v) = self.min {
            settings.min = v;
        }
        if let Some(v) = self.max {
            settings.max = v;
        }
        if let Some(v) = self.enabled {
            settings.enabled = v;
        }
    }
}

impl From<HumiditySettings> for HumidityPatch {
    fn from(s: HumiditySettings) -> Self {
        Self {
            target: Some(s.target),
            min: Some(s.min),
            max: Some(s.max),
            enabled: Some(s.enabled),
        }
    }
}

/// Partial or full settings update as received from the API layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperaturePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<HumidityPatch>,
}

impl From<Settings> for SettingsUpdate {
    fn from(s: Settings) -> Self {
        Self {
            temperature: Some(s.temperature.into()),
            humidity: Some(s.humidity.into()),
        }
    }
}

/// `a < b`, false whenever either side is NaN.
fn strictly_below(a: f32, b: f32) -> bool {
    a < b
}

fn reject(reason: String) -> SettingsError {
    SettingsError::Rejected(reason)
}

/// Owner of the live settings.
///
/// The lock is held only for the duration of a snapshot, a swap, or (by the
/// control loop) one decide-and-actuate phase of a tick.
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Settings>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// Store without a backing file.
    pub fn in_memory(initial: Settings) -> Self {
        Self {
            current: RwLock::new(initial),
            path: None,
        }
    }

    /// Loads settings from `path`. A missing file is created with defaults;
    /// an unreadable or invalid file falls back to defaults in memory and
    /// is left on disk for inspection.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match load_file(&path) {
            Ok(Some(settings)) => {
                info!("Settings loaded from {}", path.display());
                settings
            }
            Ok(None) => {
                let defaults = Settings::default();
                match write_file(&path, &defaults) {
                    Ok(()) => info!("Default settings saved to {}", path.display()),
                    Err(e) => warn!("{}", e),
                }
                defaults
            }
            Err(reason) => {
                warn!("Ignoring settings file {}: {}", path.display(), reason);
                Settings::default()
            }
        };

        Self {
            current: RwLock::new(settings),
            path: Some(path),
        }
    }

    pub async fn snapshot(&self) -> Settings {
        *self.current.read().await
    }

    /// Snapshot without waiting; `None` while a writer holds the lock.
    pub fn try_snapshot(&self) -> Option<Settings> {
        self.current.try_read().ok().map(|guard| *guard)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.current.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.current.write().await
    }

    /// Validates and swaps in the merged update. Returns the new settings.
    pub async fn apply(&self, update: &SettingsUpdate) -> Result<Settings, SettingsError> {
        let mut guard = self.current.write().await;
        let merged = guard.merged(update);
        merged.validate()?;
        *guard = merged;
        self.persist(&merged).await;
        Ok(merged)
    }

    /// Writes `settings` to the backing file on the blocking pool. Failures
    /// are logged; the in-memory settings stay authoritative. Callers hold
    /// the write guard across this so the file follows the order of swaps.
    pub async fn persist(&self, settings: &Settings) {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return,
        };
        let settings = *settings;
        match tokio::task::spawn_blocking(move || write_file(&path, &settings)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}", e),
            Err(e) => warn!("settings write task failed: {}", e),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn load_file(path: &Path) -> Result<Option<Settings>, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    let settings: Settings = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    settings.validate().map_err(|e| e.to_string())?;
    Ok(Some(settings))
}

fn write_file(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let persist_err = |reason: String| SettingsError::Persist {
        path: path.display().to_string(),
        reason,
    };
    let json = serde_json::to_string_pretty(settings).map_err(|e| persist_err(e.to_string()))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).map_err(|e| persist_err(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| persist_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_nan_threshold_is_rejected() {
        let mut t = TemperatureSettings::default();
        t.target = f32::NAN;
        assert!(matches!(t.validate(), Err(SettingsError::Rejected(_))));
    }

    #[test]
    fn test_sensor_timeout_minimum() {
        let mut t = TemperatureSettings::default();
        t.sensor_timeout_s = 4;
        assert!(t.validate().is_err());
        t.sensor_timeout_s = 5;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_legacy_sensor_timeout_key() {
        let json = r#"{"target":99.8,"min":99.6,"max":100.2,"safety_cutoff":100.3,"sensor_timeout":45,"enabled":true}"#;
        let t: TemperatureSettings = serde_json::from_str(json).unwrap();
        assert_eq!(t.sensor_timeout_s, 45);
        assert!(t.enabled);
    }

    #[test]
    fn test_merge_leaves_unpatched_fields() {
        let update = SettingsUpdate {
            humidity: Some(HumidityPatch {
                target: Some(58.0),
                ..HumidityPatch::default()
            }),
            ..SettingsUpdate::default()
        };
        let merged = Settings::default().merged(&update);
        assert_eq!(merged.humidity.target, 58.0);
        assert_eq!(merged.humidity.min, 55.0);
        assert_eq!(merged.temperature, TemperatureSettings::default());
    }
}
