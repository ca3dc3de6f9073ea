//! Common test utilities for daq_routine integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - A simulated lab whose mock devices stay inspectable
//! - Collecting routine events

#![allow(dead_code)] // Utilities may not all be used by every test file

use daq_routine::config::Settings;
use daq_routine::devices::ImageAnalyzer;
use daq_routine::events::RoutineEvent;
use daq_routine::hardware::mock::{MockAnalyzer, MockCamera, MockMassFlow, MockPump, MockThermostatLink};
use daq_routine::hardware::{CameraHardware, MassFlowHardware, PumpHardware, SerialLink};
use daq_routine::resources::{InMemoryResourceRegistry, MeasurementLayout, ResourceRegistry};
use daq_routine::routine::{Hardware, Lab, Routine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 5% tolerance
    Tight,
    /// 20% tolerance
    Normal,
}

impl TimingTolerance {
    /// Get the tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Tight => 0.05,
            TimingTolerance::Normal => 0.20,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(actual: Duration, expected: Duration, tolerance: TimingTolerance, context: &str) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// Mock devices kept alongside the lab so tests can inspect them.
pub struct SimulatedDevices {
    pub camera: Arc<MockCamera>,
    pub thermostat: Arc<MockThermostatLink>,
    pub mfc: Arc<MockMassFlow>,
    pub pump: Arc<MockPump>,
    pub analyzer: Arc<MockAnalyzer>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self {
            camera: Arc::new(MockCamera::new()),
            thermostat: Arc::new(MockThermostatLink::new(21.0)),
            mfc: Arc::new(MockMassFlow::new()),
            pump: Arc::new(MockPump::new(500.0)),
            analyzer: Arc::new(MockAnalyzer::new()),
        }
    }

    pub fn hardware(&self) -> Hardware {
        Hardware {
            camera: Arc::clone(&self.camera) as Arc<dyn CameraHardware>,
            thermostat: Arc::clone(&self.thermostat) as Arc<dyn SerialLink>,
            mfc: Arc::clone(&self.mfc) as Arc<dyn MassFlowHardware>,
            pump: Arc::clone(&self.pump) as Arc<dyn PumpHardware>,
            analyzer: Arc::clone(&self.analyzer) as Arc<dyn ImageAnalyzer>,
        }
    }
}

/// A lab on simulated devices with the measurement directories of `routine`
/// created under a temporary data directory.
pub struct TestLab {
    pub lab: Arc<Lab>,
    pub devices: SimulatedDevices,
    pub registry: Arc<InMemoryResourceRegistry>,
    pub layout: MeasurementLayout,
    pub settings: Settings,
    pub data_dir: tempfile::TempDir,
}

impl TestLab {
    pub fn start(routine: &Routine) -> Self {
        Self::start_with(routine, Settings::default())
    }

    pub fn start_with(routine: &Routine, settings: Settings) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let registry = Arc::new(InMemoryResourceRegistry::new());
        let layout = MeasurementLayout::create(data_dir.path(), &routine.name, routine, registry.as_ref())
            .expect("create measurement layout");
        let devices = SimulatedDevices::new();
        let lab = Lab::start(
            &settings,
            devices.hardware(),
            Arc::clone(&registry) as Arc<dyn ResourceRegistry>,
        );
        Self {
            lab,
            devices,
            registry,
            layout,
            settings,
            data_dir,
        }
    }
}

/// Drains every event currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<RoutineEvent>) -> Vec<RoutineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Number of `RoutineEnded` events in `events`.
pub fn ended_count(events: &[RoutineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RoutineEvent::RoutineEnded { .. }))
        .count()
}
