//! Routine definitions.
//!
//! A [`Routine`] is an ordered list of [`RoutineSlot`]s. Each slot runs for a
//! fixed duration, applies its [`Setting`]s when it starts and may end early
//! when its [`ParameterCondition`] holds. Routines (de)serialize with serde;
//! durations use humantime notation (`"90s"`, `"2m 30s"`).
//!
//! ```toml
//! name = "Bubble column"
//!
//! [[slots]]
//! name = "heat up"
//! duration = "10m"
//! condition = { parameter = "temperature", comparator = "greater_than", threshold = 36.5 }
//!
//! [[slots.settings]]
//! parameter = "temperature"
//! target = 37.0
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// What a setting controls or a condition watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// Gas mass flow.
    Mfc,
    /// Syringe pump volume.
    Pump,
    /// Image capture.
    Camera,
    /// Image analysis algorithm.
    Algorithms,
    /// Light control.
    LightMode,
    /// Thermostat temperature.
    Temperature,
    /// Analysis results collected so far.
    ResultNumber,
}

/// How a condition compares a sample with its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// Strictly greater.
    GreaterThan,
    /// Strictly less.
    LessThan,
    /// Within a small tolerance.
    EqualTo,
}

/// Early-exit rule of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterCondition {
    /// Watched parameter.
    pub parameter: Parameter,
    /// Comparison applied to the sample.
    pub comparator: Comparator,
    /// Value the sample is compared with.
    pub threshold: f64,
}

impl ParameterCondition {
    /// Condition `parameter comparator threshold`.
    pub fn new(parameter: Parameter, comparator: Comparator, threshold: f64) -> Self {
        Self {
            parameter,
            comparator,
            threshold,
        }
    }

    /// Compares a sampled value against the threshold. Equality is exact.
    pub fn evaluate(&self, value: f64) -> bool {
        match self.comparator {
            Comparator::GreaterThan => value > self.threshold,
            Comparator::LessThan => value < self.threshold,
            #[allow(clippy::float_cmp)]
            Comparator::EqualTo => value == self.threshold,
        }
    }
}

/// Operator interaction at the end of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    /// Hold the routine until the operator acknowledges.
    StopAndWait,
}

/// Light behaviour during a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightMode {
    /// Light off for the whole slot.
    AlwaysOff,
    /// The camera switches the light on around each capture burst.
    OnWhenNeeded,
    /// Light on for the whole slot.
    AlwaysOn,
}

/// Image analysis algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Bubble size distribution.
    BubbleSize,
    /// Pellet size distribution.
    PelletSize,
}

/// Frames per burst and the time between bursts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Frames per burst.
    pub images_per_interval: u32,
    /// Time between bursts.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Parameter-specific payload of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "parameter", rename_all = "snake_case")]
pub enum SettingPayload {
    /// Gas flow setpoint.
    #[serde(rename = "mfc")]
    MassFlow {
        /// Setpoint in the controller's unit.
        massflow: f64,
        /// Pause the gas flow around capture bursts.
        #[serde(default)]
        interrupt: bool,
    },
    /// Syringe volume to load, then dispense.
    Pump {
        /// Microlitres.
        volume: f64,
        /// 0 or absent means maximum flow.
        #[serde(default)]
        flow: Option<f64>,
    },
    /// Periodic capture bursts.
    Camera(CaptureSettings),
    /// Thermostat setpoint.
    Temperature {
        /// Degrees Celsius.
        target: f64,
    },
    /// Light behaviour during the slot.
    #[serde(rename = "light_mode")]
    Light {
        /// Requested behaviour.
        mode: LightMode,
    },
    /// Analysis run on the slot's images.
    #[serde(rename = "algorithms")]
    Algorithm {
        /// Algorithm to run.
        algorithm: Algorithm,
    },
}

impl SettingPayload {
    /// Parameter this payload controls.
    pub fn parameter(&self) -> Parameter {
        match self {
            SettingPayload::MassFlow { .. } => Parameter::Mfc,
            SettingPayload::Pump { .. } => Parameter::Pump,
            SettingPayload::Camera(_) => Parameter::Camera,
            SettingPayload::Temperature { .. } => Parameter::Temperature,
            SettingPayload::Light { .. } => Parameter::LightMode,
            SettingPayload::Algorithm { .. } => Parameter::Algorithms,
        }
    }
}

/// Re-applies a payload every `interval` for `duration` within a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subroutine {
    /// Time between re-applications.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Window from slot start during which the payload is re-applied.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Payload re-applied on each tick.
    pub payload: SettingPayload,
}

/// A payload applied when its slot starts, plus optional subroutines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// What the setting applies.
    #[serde(flatten)]
    pub payload: SettingPayload,
    /// Periodic re-applications within the slot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subroutines: Vec<Subroutine>,
}

impl Setting {
    /// Setting without subroutines.
    pub fn new(payload: SettingPayload) -> Self {
        Self {
            payload,
            subroutines: Vec::new(),
        }
    }

    /// Parameter this setting controls.
    pub fn parameter(&self) -> Parameter {
        self.payload.parameter()
    }
}

/// One timed step of a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineSlot {
    /// Stable identity. Generated when absent from a definition.
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,
    /// Unique within the routine.
    pub name: String,
    /// Longest time the slot runs.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// At most one per parameter.
    #[serde(default)]
    pub settings: Vec<Setting>,
    /// Ends the slot early when it holds.
    #[serde(default)]
    pub condition: Option<ParameterCondition>,
    /// Operator interaction after the wait.
    #[serde(default)]
    pub interaction: Option<Interaction>,
}

impl RoutineSlot {
    /// Empty slot with a fresh uid.
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.into(),
            duration,
            settings: Vec::new(),
            condition: None,
            interaction: None,
        }
    }

    /// Adds a setting, replacing one for the same parameter in place.
    pub fn upsert_setting(&mut self, setting: Setting) {
        match self
            .settings
            .iter_mut()
            .find(|s| s.parameter() == setting.parameter())
        {
            Some(existing) => *existing = setting,
            None => self.settings.push(setting),
        }
    }

    /// Setting for `parameter`, if any.
    pub fn setting(&self, parameter: Parameter) -> Option<&Setting> {
        self.settings.iter().find(|s| s.parameter() == parameter)
    }

    fn setting_mut(&mut self, parameter: Parameter) -> Option<&mut Setting> {
        self.settings.iter_mut().find(|s| s.parameter() == parameter)
    }

    /// Collapses duplicate parameters, keeping the last one at the position of the first.
    fn normalize(&mut self) {
        let settings = std::mem::take(&mut self.settings);
        for setting in settings {
            self.upsert_setting(setting);
        }
    }
}

/// Named sequence of slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    /// Routine name, also the measurement directory name.
    pub name: String,
    /// Slots in run order.
    #[serde(default)]
    pub slots: Vec<RoutineSlot>,
}

impl Routine {
    /// Routine without slots.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
        }
    }

    /// Parses a routine from TOML and checks it.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let mut routine: Routine = toml::from_str(text)
            .map_err(|e| DaqError::Routine(format!("Invalid routine definition: {e}")))?;
        for slot in &mut routine.slots {
            slot.normalize();
        }
        routine.validate()?;
        Ok(routine)
    }

    /// Reads and parses a TOML routine file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serializes the routine to TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Routine(format!("Cannot serialize routine: {e}")))
    }

    /// Rejects routines the engine cannot run.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Routine("Routine name cannot be empty".into()));
        }
        let mut names = HashSet::new();
        for slot in &self.slots {
            if slot.name.trim().is_empty() {
                return Err(DaqError::Routine(format!("Slot {} has an empty name", slot.uid)));
            }
            // Resources and progress are keyed by slot name.
            if !names.insert(slot.name.trim()) {
                return Err(DaqError::Routine(format!("Duplicate slot name '{}'", slot.name)));
            }
            if slot.duration.is_zero() {
                return Err(DaqError::Routine(format!("Slot '{}' has a zero duration", slot.name)));
            }
            for setting in &slot.settings {
                if let SettingPayload::Camera(capture) = &setting.payload {
                    if capture.images_per_interval == 0 || capture.interval.is_zero() {
                        return Err(DaqError::Routine(format!(
                            "Slot '{}': capture needs at least one image and a non-zero interval",
                            slot.name
                        )));
                    }
                }
                for subroutine in &setting.subroutines {
                    if subroutine.interval.is_zero() {
                        return Err(DaqError::Routine(format!(
                            "Slot '{}': subroutine interval must be non-zero",
                            slot.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Appends a slot and returns its uid. Slot names must be unique within
    /// a routine; [`Routine::validate`] rejects duplicates.
    pub fn create_slot(&mut self, name: impl Into<String>, duration: Duration) -> Uuid {
        let slot = RoutineSlot::new(name, duration);
        let uid = slot.uid;
        self.slots.push(slot);
        uid
    }

    /// Slot with `uid`.
    pub fn slot(&self, uid: Uuid) -> Option<&RoutineSlot> {
        self.slots.iter().find(|s| s.uid == uid)
    }

    /// Mutable slot with `uid`.
    pub fn slot_mut(&mut self, uid: Uuid) -> Option<&mut RoutineSlot> {
        self.slots.iter_mut().find(|s| s.uid == uid)
    }

    /// Adds a setting to a slot. A setting for the same parameter is replaced.
    pub fn add_setting(&mut self, slot: Uuid, setting: Setting) -> bool {
        match self.slot_mut(slot) {
            Some(slot) => {
                slot.upsert_setting(setting);
                true
            }
            None => false,
        }
    }

    /// Appends a subroutine to the slot's setting for `parameter`. `false` if
    /// the slot or setting does not exist.
    pub fn add_subroutine(&mut self, slot: Uuid, parameter: Parameter, subroutine: Subroutine) -> bool {
        match self.slot_mut(slot).and_then(|s| s.setting_mut(parameter)) {
            Some(setting) => {
                setting.subroutines.push(subroutine);
                true
            }
            None => false,
        }
    }

    /// Replaces the slot's condition. `false` for an unknown slot.
    pub fn set_condition(&mut self, slot: Uuid, condition: Option<ParameterCondition>) -> bool {
        match self.slot_mut(slot) {
            Some(slot) => {
                slot.condition = condition;
                true
            }
            None => false,
        }
    }

    /// Replaces the slot's interaction. `false` for an unknown slot.
    pub fn set_interaction(&mut self, slot: Uuid, interaction: Option<Interaction>) -> bool {
        match self.slot_mut(slot) {
            Some(slot) => {
                slot.interaction = interaction;
                true
            }
            None => false,
        }
    }

    /// Removes a slot. `false` if it did not exist.
    pub fn delete_slot(&mut self, uid: Uuid) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.uid != uid);
        self.slots.len() != before
    }

    /// Removes the slot's setting for `parameter`.
    pub fn delete_setting(&mut self, slot: Uuid, parameter: Parameter) -> bool {
        let Some(slot) = self.slot_mut(slot) else {
            return false;
        };
        let before = slot.settings.len();
        slot.settings.retain(|s| s.parameter() != parameter);
        slot.settings.len() != before
    }

    /// Removes the first subroutine equal to `subroutine`.
    pub fn delete_subroutine(&mut self, slot: Uuid, parameter: Parameter, subroutine: &Subroutine) -> bool {
        let Some(setting) = self.slot_mut(slot).and_then(|s| s.setting_mut(parameter)) else {
            return false;
        };
        let before = setting.subroutines.len();
        setting.subroutines.retain(|s| s != subroutine);
        setting.subroutines.len() != before
    }

    /// Names of the slots whose condition holds for the given values. Slots
    /// without a condition, or whose parameter has no value, are skipped.
    pub fn evaluate_conditions(&self, values: &HashMap<Parameter, f64>) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let condition = slot.condition?;
                let value = values.get(&condition.parameter)?;
                condition.evaluate(*value).then(|| slot.name.clone())
            })
            .collect()
    }

    /// Sum of all slot durations.
    pub fn nominal_duration(&self) -> Duration {
        self.slots.iter().map(|s| s.duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTINE: &str = r#"
name = "Bubble column"

[[slots]]
name = "heat up"
duration = "10m"
condition = { parameter = "temperature", comparator = "greater_than", threshold = 36.5 }

[[slots.settings]]
parameter = "temperature"
target = 37.0

[[slots.settings]]
parameter = "temperature"
target = 38.0

[[slots]]
name = "record"
duration = "2m 30s"
interaction = "stop_and_wait"

[[slots.settings]]
parameter = "camera"
images_per_interval = 5
interval = "10s"

[[slots.settings]]
parameter = "mfc"
massflow = 4.0

[[slots.settings.subroutines]]
interval = "30s"
duration = "2m"
payload = { parameter = "mfc", massflow = 0.0 }
"#;

    #[test]
    fn test_parse_routine_toml() {
        let routine = Routine::from_toml_str(ROUTINE).unwrap();
        assert_eq!(routine.slots.len(), 2);

        let heat = &routine.slots[0];
        assert_eq!(heat.duration, Duration::from_secs(600));
        assert_eq!(heat.settings.len(), 1);
        assert_eq!(
            heat.settings[0].payload,
            SettingPayload::Temperature { target: 38.0 }
        );

        let record = &routine.slots[1];
        assert_eq!(record.duration, Duration::from_secs(150));
        assert_eq!(record.interaction, Some(Interaction::StopAndWait));
        let mfc = record.setting(Parameter::Mfc).unwrap();
        assert_eq!(mfc.subroutines.len(), 1);
        assert_eq!(
            mfc.payload,
            SettingPayload::MassFlow {
                massflow: 4.0,
                interrupt: false
            }
        );
    }

    #[test]
    fn test_toml_round_trip_keeps_uids() {
        let routine = Routine::from_toml_str(ROUTINE).unwrap();
        let text = routine.to_toml_string().unwrap();
        let again = Routine::from_toml_str(&text).unwrap();
        assert_eq!(routine, again);
    }

    #[test]
    fn test_settings_unique_per_parameter() {
        let mut routine = Routine::new("r");
        let uid = routine.create_slot("s", Duration::from_secs(5));
        assert!(routine.add_setting(uid, Setting::new(SettingPayload::Temperature { target: 30.0 })));
        assert!(routine.add_setting(uid, Setting::new(SettingPayload::Light { mode: LightMode::AlwaysOn })));
        assert!(routine.add_setting(uid, Setting::new(SettingPayload::Temperature { target: 31.0 })));

        let slot = routine.slot(uid).unwrap();
        assert_eq!(slot.settings.len(), 2);
        assert_eq!(slot.settings[0].payload, SettingPayload::Temperature { target: 31.0 });
        assert!(!routine.add_setting(Uuid::new_v4(), Setting::new(SettingPayload::Temperature { target: 1.0 })));
    }

    #[test]
    fn test_subroutine_editing() {
        let mut routine = Routine::new("r");
        let uid = routine.create_slot("s", Duration::from_secs(60));
        let sub = Subroutine {
            interval: Duration::from_secs(10),
            duration: Duration::from_secs(30),
            payload: SettingPayload::Pump { volume: 5.0, flow: None },
        };
        assert!(!routine.add_subroutine(uid, Parameter::Pump, sub.clone()));

        routine.add_setting(uid, Setting::new(SettingPayload::Pump { volume: 10.0, flow: Some(2.0) }));
        assert!(routine.add_subroutine(uid, Parameter::Pump, sub.clone()));
        assert!(routine.delete_subroutine(uid, Parameter::Pump, &sub));
        assert!(!routine.delete_subroutine(uid, Parameter::Pump, &sub));

        assert!(routine.delete_setting(uid, Parameter::Pump));
        assert!(routine.delete_slot(uid));
        assert!(routine.slots.is_empty());
    }

    #[test]
    fn test_evaluate_conditions() {
        let mut routine = Routine::new("r");
        let warm = routine.create_slot("warm", Duration::from_secs(5));
        let count = routine.create_slot("count", Duration::from_secs(5));
        routine.create_slot("plain", Duration::from_secs(5));
        routine.set_condition(
            warm,
            Some(ParameterCondition::new(Parameter::Temperature, Comparator::GreaterThan, 30.0)),
        );
        routine.set_condition(
            count,
            Some(ParameterCondition::new(Parameter::ResultNumber, Comparator::EqualTo, 100.0)),
        );

        let values = HashMap::from([(Parameter::Temperature, 31.0)]);
        assert_eq!(routine.evaluate_conditions(&values), vec!["warm".to_string()]);

        let values = HashMap::from([(Parameter::Temperature, 20.0), (Parameter::ResultNumber, 100.0)]);
        assert_eq!(routine.evaluate_conditions(&values), vec!["count".to_string()]);
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let mut routine = Routine::new("r");
        routine.create_slot("s", Duration::ZERO);
        assert!(matches!(routine.validate(), Err(DaqError::Routine(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_slot_names() {
        let mut routine = Routine::new("r");
        routine.create_slot("rest", Duration::from_secs(5));
        routine.create_slot("flow", Duration::from_secs(5));
        assert!(routine.validate().is_ok());

        routine.create_slot(" rest ", Duration::from_secs(5));
        let err = routine.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate slot name"), "{err}");
    }
}
