//! Shared key-value context.
//!
//! The context is the only mutable state shared between the routine engine,
//! the endpoint controllers and the States they run. Configuration flows in
//! (setpoints, capture settings, slot folders) and results flow out (live
//! temperature, connection flags, result counts).
//!
//! Values live in one arena keyed by `(Namespace, Key)` behind a single lock.
//! They are stored as owned `serde_json::Value`s, so every read hands out a
//! fresh copy and no caller can alias another thread's data. [`SharedContext::take`]
//! moves a value out when a consumer wants ownership rather than a copy.

use crate::endpoint::EndpointId;
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Logical partitions of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Supervisor-level state.
    Controller,
    /// Connection flags.
    Devices,
    /// State of the running measurement.
    Measurement,
    /// Camera settings.
    Camera,
    /// Thermostat settings.
    Thermostat,
    /// Mass flow settings.
    Mfc,
    /// Pump settings.
    Pump,
    /// Analysis inputs and outputs.
    Analysis,
}

/// Typed keys understood by the endpoints and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Connection flag of a device endpoint (`Devices` namespace).
    Connected(EndpointId),
    /// Names of the connected devices.
    ConnectedDevices,

    // Measurement
    /// A routine is running.
    MeasurementRunning,
    /// The operator released a waiting slot.
    OperatorAcknowledged,
    /// Resource space of the running slot.
    CurrentResourceSpace,
    /// Directory of the running slot.
    SlotFolder,
    /// Calibration folder of the running slot.
    SlotCalibrationFolder,
    /// Result folder of the running slot.
    SlotResultFolder,
    /// Image folder of the running slot.
    SlotImagesFolder,
    /// Result database of the running slot.
    SlotResultDb,
    /// Last temperature reading.
    LiveTemperature,
    /// Last measured flow.
    LiveMassflow,
    /// Analysis results produced in the running slot.
    ResultCount,
    /// Requested light state.
    LightMode,
    /// The camera switches the light around bursts.
    CameraLightSwitching,
    /// The camera pauses the gas flow around bursts.
    MassflowInterrupt,
    /// Last calibration frame.
    CalibrationImagePath,

    // Device settings
    /// Thermostat setpoint to write.
    TemperatureSetpoint,
    /// Sensor polling publishes live readings.
    LiveRecording,
    /// Burst size and interval.
    CaptureSettings,
    /// Acquisition parameters to apply.
    CameraDeviceSettings,
    /// Acquisition parameters the camera reported back.
    CameraDeviceSettingsApplied,
    /// Flow setpoint to write.
    MassflowSetpoint,
    /// The flow settled at its setpoint.
    MassflowApplied,
    /// Volume to aspirate.
    PumpLoadVolume,
    /// Volume to dispense.
    PumpUnloadVolume,
    /// Pump flow, absent for maximum.
    PumpFlow,
    /// Mounted syringe diameter.
    SyringeDiameter,
    /// Mounted syringe length.
    SyringeLength,

    // Analysis
    /// Images for single-image analysis.
    AnalysisTarget,
    /// Last analysis result.
    AnalysisResult,
}

/// Thread-safe, namespaced value store.
#[derive(Debug, Default)]
pub struct SharedContext {
    values: Mutex<HashMap<(Namespace, Key), Value>>,
}

impl SharedContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `value`, replacing any previous entry.
    pub fn set<T: Serialize>(&self, namespace: Namespace, key: Key, value: T) {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.values.lock().insert((namespace, key), value);
            }
            Err(e) => warn!(?namespace, ?key, error = %e, "Dropping unserializable context value"),
        }
    }

    /// Returns a copy of the value, or `None` when it is absent or has another shape.
    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: Key) -> Option<T> {
        match self.try_get(namespace, key) {
            Ok(value) => value,
            Err(e) => {
                warn!(?namespace, ?key, error = %e, "Ignoring context value");
                None
            }
        }
    }

    /// Like [`get`](Self::get) but reports a shape mismatch as an error.
    pub fn try_get<T: DeserializeOwned>(&self, namespace: Namespace, key: Key) -> AppResult<Option<T>> {
        let value = self.values.lock().get(&(namespace, key)).cloned();
        value
            .map(|v| serde_json::from_value(v).map_err(|source| DaqError::ContextType { key, source }))
            .transpose()
    }

    /// Returns the value or a [`DaqError::MissingContext`] error.
    pub fn require<T: DeserializeOwned>(&self, namespace: Namespace, key: Key) -> AppResult<T> {
        self.try_get(namespace, key)?
            .ok_or(DaqError::MissingContext { namespace, key })
    }

    /// Reads a boolean flag, treating an absent entry as `false`.
    pub fn flag(&self, namespace: Namespace, key: Key) -> bool {
        self.get(namespace, key).unwrap_or(false)
    }

    /// Moves the value out of the context.
    pub fn take<T: DeserializeOwned>(&self, namespace: Namespace, key: Key) -> Option<T> {
        let value = self.values.lock().remove(&(namespace, key))?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(?namespace, ?key, error = %e, "Discarding context value taken with the wrong type");
                None
            }
        }
    }

    /// Removes an entry. Returns whether it existed.
    pub fn remove(&self, namespace: Namespace, key: Key) -> bool {
        self.values.lock().remove(&(namespace, key)).is_some()
    }

    /// Whether an entry exists.
    pub fn contains(&self, namespace: Namespace, key: Key) -> bool {
        self.values.lock().contains_key(&(namespace, key))
    }

    /// Clears every entry of one namespace.
    pub fn purge(&self, namespace: Namespace) {
        self.values.lock().retain(|(ns, _), _| *ns != namespace);
    }

    /// Namespaces that currently hold at least one value.
    pub fn namespaces(&self) -> Vec<Namespace> {
        let values = self.values.lock();
        values
            .keys()
            .map(|(ns, _)| *ns)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
