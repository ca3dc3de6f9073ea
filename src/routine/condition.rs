//! Condition evaluation against live samples.

use super::model::{Parameter, ParameterCondition};
use crate::context::{Key, Namespace, SharedContext};
use std::collections::HashMap;

/// Compares `value` against `condition`. Pure; equality is exact.
pub fn evaluate(condition: &ParameterCondition, value: f64) -> bool {
    condition.evaluate(value)
}

/// Supplies the current value of a watched parameter.
pub trait SampleSource: Send + Sync {
    /// `None` when no sample exists yet.
    fn sample(&self, parameter: Parameter) -> Option<f64>;
}

/// Where each watchable parameter lives in the context.
pub fn sample_location(parameter: Parameter) -> Option<(Namespace, Key)> {
    match parameter {
        Parameter::Temperature => Some((Namespace::Measurement, Key::LiveTemperature)),
        Parameter::ResultNumber => Some((Namespace::Measurement, Key::ResultCount)),
        Parameter::Mfc => Some((Namespace::Mfc, Key::LiveMassflow)),
        Parameter::Pump | Parameter::Camera | Parameter::Algorithms | Parameter::LightMode => None,
    }
}

impl SampleSource for SharedContext {
    fn sample(&self, parameter: Parameter) -> Option<f64> {
        let (namespace, key) = sample_location(parameter)?;
        self.get(namespace, key)
    }
}

impl SampleSource for HashMap<Parameter, f64> {
    fn sample(&self, parameter: Parameter) -> Option<f64> {
        self.get(&parameter).copied()
    }
}

impl SampleSource for parking_lot::RwLock<HashMap<Parameter, f64>> {
    fn sample(&self, parameter: Parameter) -> Option<f64> {
        self.read().get(&parameter).copied()
    }
}

/// Samples and evaluates. A missing sample is "not yet satisfied".
pub fn check(condition: &ParameterCondition, source: &dyn SampleSource) -> bool {
    source
        .sample(condition.parameter)
        .is_some_and(|value| evaluate(condition, value))
}
