//! Layered configuration using Figment.
//!
//! Settings are resolved in this order (lowest to highest precedence):
//! 1. Built-in defaults
//! 2. A TOML file
//! 3. Environment variables prefixed with `DAQ_ROUTINE_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_ROUTINE_APPLICATION__LOG_LEVEL=debug
//! DAQ_ROUTINE_ENDPOINTS__CAMERA_POOL=4
//! DAQ_ROUTINE_ROUTINE__TICK_INTERVAL_MS=250
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_ROUTINE_";

/// Allowed pool size for single-device endpoints.
pub const DEVICE_POOL_RANGE: RangeInclusive<usize> = 2..=10;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application identity, logging and data location.
    pub application: ApplicationSettings,
    /// Endpoint controller tuning.
    pub endpoints: EndpointSettings,
    /// Routine engine timing.
    pub routine: RoutineSettings,
    /// Per-device tuning.
    pub devices: DeviceSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,
    /// Root folder for measurement directories.
    pub data_dir: PathBuf,
}

/// Endpoint controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Worker loop poll interval.
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for in-flight States during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Concurrent States allowed on the camera endpoint.
    pub camera_pool: usize,
    /// Concurrent States allowed on the thermostat endpoint.
    pub thermostat_pool: usize,
    /// Concurrent States allowed on the mass flow endpoint.
    pub mfc_pool: usize,
    /// Concurrent States allowed on the pump endpoint.
    pub pump_pool: usize,
    /// Concurrent States allowed on the device supervisor.
    pub supervisor_pool: usize,
    /// The analysis endpoint runs its States in parallel.
    pub analysis_pool: usize,
    /// Period of the device supervisor's health check.
    pub health_check_interval_secs: u64,
}

/// Routine engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutineSettings {
    /// Slot wait loop tick.
    pub tick_interval_ms: u64,
    /// Poll interval while waiting for operator acknowledgement.
    pub interaction_poll_ms: u64,
    /// Buffer size of the notification bus.
    pub event_capacity: usize,
    /// How long a finished slot waits for the analysis endpoint to process
    /// the images it already collected before resetting it.
    pub analysis_drain_ms: u64,
    /// How long a slot reset waits for the endpoints it stopped to finish
    /// their exit work and queued follow-ups.
    pub reset_timeout_ms: u64,
}

/// Per-device tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Thermostat board settings.
    pub thermostat: ThermostatSettings,
    /// Mass flow controller settings.
    pub mfc: MfcSettings,
    /// Syringe pump settings.
    pub pump: PumpSettings,
    /// Image analysis settings.
    pub analysis: AnalysisSettings,
}

/// Thermostat board tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatSettings {
    /// Period of live sensor reads while recording.
    pub sensor_poll_secs: u64,
    /// Time the light needs after switching before frames are usable.
    pub light_settle_ms: u64,
    /// Capture intervals shorter than this keep the light on.
    pub light_switch_min_interval_secs: u64,
}

/// Mass flow controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MfcSettings {
    /// Largest deviation between setpoint and measured flow that counts as applied.
    pub setpoint_tolerance: f64,
    /// Wait after writing a setpoint before reading it back.
    pub settle_ms: u64,
}

/// Syringe pump tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    /// Inner diameter of the mounted syringe.
    pub syringe_diameter_mm: f64,
    /// Usable length of the mounted syringe.
    pub syringe_length_mm: f64,
    /// Fill level window within which a load or dispense counts as done.
    pub volume_tolerance_ul: f64,
}

/// Image analysis batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Images per analysis batch.
    pub batch_size: usize,
    /// Batches analysed at the same time.
    pub max_parallel_batches: usize,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "daq-routine".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            shutdown_timeout_ms: 5000,
            camera_pool: 5,
            thermostat_pool: 2,
            mfc_pool: 5,
            pump_pool: 5,
            supervisor_pool: 2,
            analysis_pool: 10,
            health_check_interval_secs: 10,
        }
    }
}

impl Default for RoutineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            interaction_poll_ms: 1000,
            event_capacity: 64,
            analysis_drain_ms: 30_000,
            reset_timeout_ms: 5000,
        }
    }
}

impl Default for ThermostatSettings {
    fn default() -> Self {
        Self {
            sensor_poll_secs: 15,
            light_settle_ms: 3000,
            light_switch_min_interval_secs: 5,
        }
    }
}

impl Default for MfcSettings {
    fn default() -> Self {
        Self {
            setpoint_tolerance: 2.5,
            settle_ms: 500,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            syringe_diameter_mm: 7.97,
            syringe_length_mm: 50.0,
            volume_tolerance_ul: 5.0,
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_parallel_batches: 10,
        }
    }
}

impl Settings {
    /// Loads defaults, then environment overrides, without a file.
    pub fn load() -> AppResult<Self> {
        Self::from_figment(Self::figment())
    }

    /// Loads defaults, the TOML file at `path`, then environment overrides.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be parsed or a value does not pass
    /// [`validate`](Self::validate).
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects out-of-range values, naming the offending field.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid application.log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let endpoints = &self.endpoints;
        let device_pools = [
            ("endpoints.camera_pool", endpoints.camera_pool),
            ("endpoints.thermostat_pool", endpoints.thermostat_pool),
            ("endpoints.mfc_pool", endpoints.mfc_pool),
            ("endpoints.pump_pool", endpoints.pump_pool),
            ("endpoints.supervisor_pool", endpoints.supervisor_pool),
        ];
        for (field, size) in device_pools {
            if !DEVICE_POOL_RANGE.contains(&size) {
                return Err(DaqError::Configuration(format!(
                    "Invalid {field} {size}. Must be {}-{}",
                    DEVICE_POOL_RANGE.start(),
                    DEVICE_POOL_RANGE.end()
                )));
            }
        }

        let positive = [
            ("endpoints.analysis_pool", endpoints.analysis_pool as u64),
            ("endpoints.poll_interval_ms", endpoints.poll_interval_ms),
            (
                "endpoints.health_check_interval_secs",
                endpoints.health_check_interval_secs,
            ),
            ("routine.tick_interval_ms", self.routine.tick_interval_ms),
            ("routine.interaction_poll_ms", self.routine.interaction_poll_ms),
            ("routine.event_capacity", self.routine.event_capacity as u64),
            (
                "devices.thermostat.sensor_poll_secs",
                self.devices.thermostat.sensor_poll_secs,
            ),
            ("devices.analysis.batch_size", self.devices.analysis.batch_size as u64),
            (
                "devices.analysis.max_parallel_batches",
                self.devices.analysis.max_parallel_batches as u64,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(DaqError::Configuration(format!(
                    "Invalid {field} 0. Must be > 0"
                )));
            }
        }

        let pump = &self.devices.pump;
        let dimensions = [
            ("devices.pump.syringe_diameter_mm", pump.syringe_diameter_mm),
            ("devices.pump.syringe_length_mm", pump.syringe_length_mm),
        ];
        for (field, value) in dimensions {
            if !(value.is_finite() && value > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "Invalid {field} {value}. Must be a positive number"
                )));
            }
        }

        let tolerances = [
            ("devices.pump.volume_tolerance_ul", pump.volume_tolerance_ul),
            ("devices.mfc.setpoint_tolerance", self.devices.mfc.setpoint_tolerance),
        ];
        for (field, value) in tolerances {
            if !(value.is_finite() && value >= 0.0) {
                return Err(DaqError::Configuration(format!(
                    "Invalid {field} {value}. Must be >= 0"
                )));
            }
        }

        Ok(())
    }
}

impl EndpointSettings {
    /// [`Self::poll_interval_ms`] as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown wait bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Health check period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl RoutineSettings {
    /// [`Self::tick_interval_ms`] as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Operator acknowledgement poll interval.
    pub fn interaction_poll(&self) -> Duration {
        Duration::from_millis(self.interaction_poll_ms)
    }

    /// Analysis drain bound at slot end.
    pub fn analysis_drain(&self) -> Duration {
        Duration::from_millis(self.analysis_drain_ms)
    }

    /// Bound on waiting for stopped endpoints to go quiet.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.endpoints.poll_interval(), Duration::from_millis(50));
        assert_eq!(settings.routine.tick_interval(), Duration::from_secs(1));
        assert_eq!(settings.endpoints.analysis_pool, 10);
    }

    #[test]
    fn test_load_from_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[endpoints]
camera_pool = 3

[devices.pump]
syringe_diameter_mm = 4.5
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.endpoints.camera_pool, 3);
        assert_eq!(settings.endpoints.mfc_pool, 5);
        assert_eq!(settings.devices.pump.syringe_diameter_mm, 4.5);
        assert_eq!(settings.devices.pump.syringe_length_mm, 50.0);
    }

    #[test]
    fn test_device_pool_out_of_range() {
        let mut settings = Settings::default();
        settings.endpoints.thermostat_pool = 1;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("endpoints.thermostat_pool"));

        settings.endpoints.thermostat_pool = 11;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_analysis_pool_may_exceed_device_range() {
        let mut settings = Settings::default();
        settings.endpoints.analysis_pool = 32;
        settings.validate().unwrap();

        settings.endpoints.analysis_pool = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("log_level")
        ));
    }

    #[test]
    fn test_invalid_syringe_dimensions() {
        let mut settings = Settings::default();
        settings.devices.pump.syringe_length_mm = 0.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("syringe_length_mm"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[endpoints]\ncamera_pool = \"many\"").unwrap();
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }
}
