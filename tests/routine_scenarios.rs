//! End-to-end routine runs on simulated devices with a paused clock.

mod common;

use common::{assert_duration_near, drain_events, ended_count, TestLab, TimingTolerance};
use daq_routine::context::{Key, Namespace};
use daq_routine::devices::{CameraKind, MfcKind, ThermostatKind};
use daq_routine::events::{RoutineEvent, RoutineOutcome};
use daq_routine::resources::ResourceRegistry;
use daq_routine::routine::{
    CaptureSettings, Comparator, LightMode, Parameter, ParameterCondition, Routine, RoutineRunner, SampleSource,
    Setting, SettingPayload, SlotExit, Subroutine,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn mass_flow(massflow: f64) -> Setting {
    Setting::new(SettingPayload::MassFlow {
        massflow,
        interrupt: false,
    })
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_to_completion() {
    let mut routine = Routine::new("single slot");
    let slot = routine.create_slot("flow", Duration::from_secs(2));
    routine.add_setting(slot, mass_flow(6.0));

    let rig = TestLab::start(&routine);
    let mut events = rig.lab.events().subscribe();
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());
    let progress = handle.progress();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(progress.get("flow").map(|(target, _)| target), Some(2));

    assert!(handle.reports().is_empty());
    assert_eq!(handle.join().await, RoutineOutcome::Completed);

    assert_eq!(rig.lab.mfc.last_dispatched(), Some(MfcKind::SetMassflow));
    assert_eq!(rig.devices.mfc.writes(), vec![6.0]);
    assert!(rig.lab.mfc.is_idle());
    assert!(progress.names().is_empty());

    let events = drain_events(&mut events);
    assert_eq!(ended_count(&events), 1);
    assert!(matches!(events.first(), Some(RoutineEvent::SlotProgressed { name, .. }) if name == "flow"));
    assert_eq!(
        events.last(),
        Some(&RoutineEvent::RoutineEnded {
            routine: "single slot".to_string(),
            outcome: RoutineOutcome::Completed,
        })
    );
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slot_progress_reaches_target() {
    let mut routine = Routine::new("progress");
    let slot = routine.create_slot("flow", Duration::from_secs(2));
    routine.add_setting(slot, mass_flow(3.0));

    let rig = TestLab::start(&routine);
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(handle.is_finished());
    let reports = handle.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].exit, SlotExit::Elapsed);
    assert_eq!(reports[0].progress, (2, 2));
    assert_duration_near(
        reports[0].elapsed,
        Duration::from_secs(2),
        TimingTolerance::Tight,
        "slot duration",
    );
    assert_eq!(handle.join().await, RoutineOutcome::Completed);
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_condition_already_true_ends_slot_early() {
    let mut routine = Routine::new("early exit");
    let slot = routine.create_slot("wait for heat", Duration::from_secs(60));
    routine.set_condition(
        slot,
        Some(ParameterCondition::new(Parameter::Temperature, Comparator::GreaterThan, 30.0)),
    );

    let rig = TestLab::start(&routine);
    let source: Arc<dyn SampleSource> = Arc::new(HashMap::from([(Parameter::Temperature, 35.0)]));
    let handle =
        RoutineRunner::spawn_with_source(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone(), source);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.is_finished());
    let reports = handle.reports();
    assert_eq!(reports[0].exit, SlotExit::Condition);
    assert!(reports[0].elapsed < Duration::from_secs(1));
    assert_eq!(reports[0].progress, (60, 60));
    assert_eq!(handle.join().await, RoutineOutcome::Completed);
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_condition_met_mid_slot() {
    let mut routine = Routine::new("live condition");
    let slot = routine.create_slot("fill", Duration::from_secs(120));
    routine.set_condition(
        slot,
        Some(ParameterCondition::new(Parameter::ResultNumber, Comparator::EqualTo, 10.0)),
    );
    routine.create_slot("next", Duration::from_secs(1));

    let rig = TestLab::start(&routine);
    let samples = Arc::new(RwLock::new(HashMap::from([(Parameter::ResultNumber, 0.0)])));
    let handle = RoutineRunner::spawn_with_source(
        &routine,
        Arc::clone(&rig.lab),
        rig.settings.routine.clone(),
        Arc::clone(&samples) as Arc<dyn SampleSource>,
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(handle.reports().is_empty());
    samples.write().insert(Parameter::ResultNumber, 10.0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let reports = handle.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].exit, SlotExit::Condition);
    assert!(reports[0].elapsed >= Duration::from_secs(10));
    assert!(reports[0].elapsed <= Duration::from_secs(11));
    assert_eq!(reports[1].exit, SlotExit::Elapsed);
    assert_eq!(handle.join().await, RoutineOutcome::Completed);
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_slot_idles_touched_endpoints() {
    let mut routine = Routine::new("interrupted");
    let slot = routine.create_slot("record", Duration::from_secs(120));
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::Camera(CaptureSettings {
            images_per_interval: 2,
            interval: Duration::from_secs(30),
        })),
    );
    routine.add_setting(slot, Setting::new(SettingPayload::Temperature { target: 37.0 }));
    routine.create_slot("never reached", Duration::from_secs(10));

    let rig = TestLab::start(&routine);
    let mut events = rig.lab.events().subscribe();
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.lab.camera.current_state_kind(), Some(CameraKind::Capture));
    assert_eq!(
        rig.lab.thermostat.last_dispatched(),
        Some(ThermostatKind::SensorPolling)
    );
    assert!(rig.devices.camera.is_streaming());

    handle.stop();
    tokio::time::sleep(rig.settings.routine.tick_interval()).await;
    assert!(rig.lab.camera.is_idle());
    assert!(rig.lab.thermostat.is_idle());
    assert!(!rig.devices.camera.is_streaming());

    assert_eq!(handle.join().await, RoutineOutcome::Stopped);
    let events = drain_events(&mut events);
    assert_eq!(ended_count(&events), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RoutineEvent::SlotProgressed { .. }))
            .count(),
        1
    );
    assert!(!rig.lab.context().flag(Namespace::Measurement, Key::MeasurementRunning));
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subroutine_reapplies_setting() {
    let mut routine = Routine::new("pulsed flow");
    let slot = routine.create_slot("pulse", Duration::from_secs(30));
    routine.add_setting(slot, mass_flow(8.0));
    routine.add_subroutine(
        slot,
        Parameter::Mfc,
        Subroutine {
            interval: Duration::from_secs(10),
            duration: Duration::from_secs(25),
            payload: SettingPayload::MassFlow {
                massflow: 2.0,
                interrupt: false,
            },
        },
    );

    let rig = TestLab::start(&routine);
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());
    assert_eq!(handle.join().await, RoutineOutcome::Completed);

    // Initial setting, then ticks at 10 s and 20 s.
    assert_eq!(rig.devices.mfc.writes(), vec![8.0, 2.0, 2.0]);
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_capture_feeds_analysis() {
    let mut routine = Routine::new("capture and size");
    let slot = routine.create_slot("record", Duration::from_secs(25));
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::Camera(CaptureSettings {
            images_per_interval: 2,
            interval: Duration::from_secs(10),
        })),
    );
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::Algorithm {
            algorithm: daq_routine::routine::Algorithm::BubbleSize,
        }),
    );

    let rig = TestLab::start(&routine);
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());
    assert_eq!(handle.join().await, RoutineOutcome::Completed);

    let images = rig.layout.slots[0].1.join("Images");
    let saved = std::fs::read_dir(&images).unwrap().count();
    assert_eq!(saved, 4, "two bursts of two frames");
    assert_eq!(rig.lab.analysis.endpoint().results().len(), 4);
    assert_eq!(
        rig.lab.context().get::<u64>(Namespace::Measurement, Key::ResultCount),
        Some(4)
    );
    // The image space of the slot is gone once analysis finished.
    assert!(rig
        .registry
        .spaces()
        .iter()
        .all(|space| space != &routine.slots[0].uid.to_string()));
    rig.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slot_ending_mid_burst_reopens_valve() {
    let mut routine = Routine::new("pulse");
    let slot = routine.create_slot("pulse", Duration::from_secs(6));
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::MassFlow {
            massflow: 10.0,
            interrupt: true,
        }),
    );
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::Camera(CaptureSettings {
            images_per_interval: 1,
            interval: Duration::from_secs(5),
        })),
    );
    routine.add_setting(
        slot,
        Setting::new(SettingPayload::Light {
            mode: LightMode::OnWhenNeeded,
        }),
    );

    let rig = TestLab::start(&routine);
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&rig.lab), rig.settings.routine.clone());
    assert_eq!(handle.join().await, RoutineOutcome::Completed);

    // The burst at 5 s closes the valve and is still settling the light when the slot ends.
    assert_eq!(rig.devices.mfc.writes(), vec![10.0, 0.0, 10.0]);
    assert_eq!(rig.devices.mfc.setpoint(), 10.0);
    assert!(rig.lab.mfc.is_idle());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!rig.devices.thermostat.light());
    rig.lab.shutdown().await;
}
