//! Routine execution engine.
//!
//! [`RoutineRunner::spawn`] copies the slots of a [`Routine`] and walks them
//! on a dedicated task. Per slot the engine:
//!
//! 1. resolves the slot's result destinations (failure aborts the routine)
//! 2. stages every setting in the shared context, then enqueues the States
//!    that consume them
//! 3. opens the start gates of the endpoints it touched, so their timed loops
//!    begin together
//! 4. waits until the slot duration elapses, its condition holds or a stop
//!    is requested
//! 5. waits for the operator if the slot asks for it
//! 6. stops every touched endpoint, closes the gates and completes the
//!    slot's progress space
//!
//! Nothing in here returns an error to the caller; the outcome of a run is
//! reported through [`RoutineHandle::join`] and a single
//! [`RoutineEvent::RoutineEnded`].

use super::condition::{self, SampleSource};
use super::lab::Lab;
use super::model::{Interaction, LightMode, Parameter, Routine, RoutineSlot, SettingPayload};
use crate::config::RoutineSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::devices::{AnalysisKind, CameraKind, MfcKind, PumpKind, ThermostatKind};
use crate::endpoint::{EndpointId, PeriodicJob, Schedule};
use crate::error::AppResult;
use crate::events::{RoutineEvent, RoutineOutcome};
use crate::progress::ProgressTracker;
use crate::resources::SlotPaths;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const ANALYSIS_IDLE_POLL: Duration = Duration::from_millis(250);
const RESET_POLL: Duration = Duration::from_millis(50);

/// Why a slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotExit {
    /// The slot ran its full duration.
    Elapsed,
    /// The slot's condition held.
    Condition,
    /// The routine was stopped during the slot.
    Stopped,
}

/// Summary of a finished slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotReport {
    /// Slot uid.
    pub uid: Uuid,
    /// Slot name.
    pub name: String,
    /// Why the slot ended.
    pub exit: SlotExit,
    /// Time from slot start to the end of its reset.
    pub elapsed: Duration,
    /// `(target, current)` of the slot's progress space after the reset.
    pub progress: (u64, u64),
}

/// Runs the slots of a routine one after another on a [`Lab`].
pub struct RoutineRunner {
    name: String,
    slots: VecDeque<RoutineSlot>,
    lab: Arc<Lab>,
    settings: RoutineSettings,
    source: Arc<dyn SampleSource>,
    stop: CancellationToken,
    progress: Arc<ProgressTracker>,
    reports: Arc<Mutex<Vec<SlotReport>>>,
}

impl RoutineRunner {
    /// Runs `routine` with conditions sampled from the lab's context.
    pub fn spawn(routine: &Routine, lab: Arc<Lab>, settings: RoutineSettings) -> RoutineHandle {
        let source = Arc::clone(lab.context()) as Arc<dyn SampleSource>;
        Self::spawn_with_source(routine, lab, settings, source)
    }

    /// Runs `routine` with conditions sampled from `source`.
    pub fn spawn_with_source(
        routine: &Routine,
        lab: Arc<Lab>,
        settings: RoutineSettings,
        source: Arc<dyn SampleSource>,
    ) -> RoutineHandle {
        let stop = CancellationToken::new();
        let progress = Arc::new(ProgressTracker::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let ctx = Arc::clone(lab.context());

        let runner = Self {
            name: routine.name.clone(),
            slots: routine.slots.iter().cloned().collect(),
            lab,
            settings,
            source,
            stop: stop.clone(),
            progress: Arc::clone(&progress),
            reports: Arc::clone(&reports),
        };
        let task = tokio::spawn(runner.run());

        RoutineHandle {
            name: routine.name.clone(),
            stop,
            ctx,
            progress,
            reports,
            task,
        }
    }

    #[instrument(skip_all, fields(routine = %self.name))]
    async fn run(mut self) -> RoutineOutcome {
        let ctx = Arc::clone(self.lab.context());
        ctx.set(Namespace::Measurement, Key::MeasurementRunning, true);
        info!(slots = self.slots.len(), "Routine started");

        let outcome = loop {
            if self.stop.is_cancelled() {
                break RoutineOutcome::Stopped;
            }
            let Some(slot) = self.slots.pop_front() else {
                break RoutineOutcome::Completed;
            };
            match self.run_slot(&slot).await {
                Ok(SlotExit::Stopped) => break RoutineOutcome::Stopped,
                Ok(_) => {}
                Err(e) => {
                    error!(slot = %slot.name, error = %e, "Slot failed, stopping routine");
                    break RoutineOutcome::Aborted(e.to_string());
                }
            }
        };

        if !self.slots.is_empty() {
            debug!(discarded = self.slots.len(), "Discarding remaining slots");
            self.slots.clear();
        }
        self.lab.stop_all();
        self.progress.purge();
        ctx.set(Namespace::Measurement, Key::MeasurementRunning, false);

        match &outcome {
            RoutineOutcome::Completed => info!("Routine completed"),
            RoutineOutcome::Stopped => info!("Routine stopped"),
            RoutineOutcome::Aborted(reason) => warn!(%reason, "Routine aborted"),
        }
        self.lab.events().publish(RoutineEvent::RoutineEnded {
            routine: self.name.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    #[instrument(skip_all, fields(slot = %slot.name))]
    async fn run_slot(&self, slot: &RoutineSlot) -> AppResult<SlotExit> {
        let target = slot.duration.as_secs().max(1);
        if !self.progress.add(&slot.name, target) {
            self.progress.update_target(&slot.name, target);
            self.progress.set(&slot.name, 0);
        }

        let paths = self.lab.resources().slot_paths(&slot.name)?;
        let ctx = self.lab.context();
        publish_slot_paths(ctx, &paths, slot.uid);

        let watched = slot.condition.map(|c| c.parameter);
        if let Some(parameter) = watched {
            clear_stale_sample(ctx, slot, parameter);
        }

        let started = Instant::now();
        let end = started + slot.duration;

        for setting in &slot.settings {
            stage(ctx, &setting.payload, watched);
        }
        for setting in &slot.settings {
            dispatch(&self.lab, &setting.payload, slot.duration);
        }
        let touched = touched_endpoints(slot);
        let subroutines = self.start_subroutines(slot, end, watched);

        for id in &touched {
            if let Some(gate) = self.lab.gate(*id) {
                gate.open();
            }
        }
        self.lab.events().publish(RoutineEvent::SlotProgressed {
            routine: self.name.clone(),
            slot: slot.uid,
            name: slot.name.clone(),
        });
        info!(
            duration = ?slot.duration,
            settings = slot.settings.len(),
            endpoints = touched.len(),
            "Slot started"
        );

        let mut exit = self.wait(slot, started, end).await;
        if exit != SlotExit::Stopped
            && slot.interaction == Some(Interaction::StopAndWait)
            && !self.await_operator(slot).await
        {
            exit = SlotExit::Stopped;
        }

        drop(subroutines);
        self.reset(slot, &touched, exit).await;

        let report = SlotReport {
            uid: slot.uid,
            name: slot.name.clone(),
            exit,
            elapsed: started.elapsed(),
            progress: self.progress.get(&slot.name).unwrap_or((target, target)),
        };
        info!(exit = ?report.exit, elapsed = ?report.elapsed, "Slot finished");
        self.reports.lock().push(report);
        Ok(exit)
    }

    /// Ticks until the slot ends. The condition is checked before the first
    /// sleep, so a condition that already holds ends the slot at once.
    async fn wait(&self, slot: &RoutineSlot, started: Instant, end: Instant) -> SlotExit {
        let tick = self.settings.tick_interval();
        loop {
            let elapsed = started.elapsed();
            self.progress
                .set(&slot.name, i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX));
            if elapsed >= slot.duration {
                return SlotExit::Elapsed;
            }

            if let Some(condition) = &slot.condition {
                if condition.parameter == Parameter::Mfc {
                    self.lab.mfc.enqueue(MfcKind::ReadMassflow, Duration::ZERO);
                }
                if condition::check(condition, self.source.as_ref()) {
                    info!(parameter = ?condition.parameter, threshold = condition.threshold, "Slot condition met");
                    return SlotExit::Condition;
                }
            }

            let nap = tick.min(end.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = self.stop.cancelled() => return SlotExit::Stopped,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Returns `false` if a stop arrived before the acknowledgement.
    async fn await_operator(&self, slot: &RoutineSlot) -> bool {
        let ctx = self.lab.context();
        ctx.set(Namespace::Measurement, Key::OperatorAcknowledged, false);
        self.lab.events().publish(RoutineEvent::AwaitingOperator {
            routine: self.name.clone(),
            slot: slot.uid,
            name: slot.name.clone(),
        });
        info!("Waiting for operator acknowledgement");

        let poll = self.settings.interaction_poll();
        let acknowledged = loop {
            if ctx.flag(Namespace::Measurement, Key::OperatorAcknowledged) {
                break true;
            }
            tokio::select! {
                _ = self.stop.cancelled() => break false,
                _ = tokio::time::sleep(poll) => {}
            }
        };
        ctx.remove(Namespace::Measurement, Key::OperatorAcknowledged);
        acknowledged
    }

    fn start_subroutines(&self, slot: &RoutineSlot, end: Instant, watched: Option<Parameter>) -> Vec<PeriodicJob> {
        let mut jobs = Vec::new();
        for subroutine in slot.settings.iter().flat_map(|s| s.subroutines.iter()) {
            let until = (Instant::now() + subroutine.duration).min(end);
            let lab = Arc::clone(&self.lab);
            let payload = subroutine.payload.clone();
            debug!(parameter = ?payload.parameter(), interval = ?subroutine.interval, "Starting subroutine");
            jobs.push(PeriodicJob::spawn(
                "subroutine",
                Schedule::every(subroutine.interval).delayed().until(until),
                self.stop.child_token(),
                move || {
                    stage(lab.context(), &payload, watched);
                    dispatch(&lab, &payload, end.saturating_duration_since(Instant::now()));
                    async {}
                },
            ));
        }
        jobs
    }

    async fn reset(&self, slot: &RoutineSlot, touched: &BTreeSet<EndpointId>, exit: SlotExit) {
        if exit == SlotExit::Elapsed && touched.contains(&EndpointId::Analysis) {
            self.drain_analysis().await;
        }

        for id in touched {
            if let Some(gate) = self.lab.gate(*id) {
                gate.close();
            }
            self.lab.endpoint(*id).stop();
        }
        self.await_quiet(touched).await;

        let ctx = self.lab.context();
        ctx.set(Namespace::Measurement, Key::CameraLightSwitching, false);
        ctx.set(Namespace::Measurement, Key::MassflowInterrupt, false);
        ctx.set(Namespace::Thermostat, Key::LiveRecording, false);
        self.progress.complete(&slot.name);
        debug!(endpoints = touched.len(), "Slot reset");
    }

    /// Waits until every stopped endpoint has run its exit work and the
    /// follow-up tasks it queued on the others (a capture reopening the
    /// valve it closed). Bounded by the reset timeout, not by a stop.
    async fn await_quiet(&self, touched: &BTreeSet<EndpointId>) {
        let deadline = Instant::now() + self.settings.reset_timeout();
        let endpoints: Vec<_> = touched.iter().map(|id| self.lab.endpoint(*id)).collect();
        while !endpoints.iter().all(|endpoint| endpoint.is_quiet()) {
            if Instant::now() >= deadline {
                let busy: Vec<_> = endpoints
                    .iter()
                    .filter(|endpoint| !endpoint.is_quiet())
                    .map(|endpoint| endpoint.id().name())
                    .collect();
                warn!(?busy, "Endpoints still busy after the reset timeout");
                return;
            }
            tokio::time::sleep(RESET_POLL).await;
        }
    }

    /// Gives the analysis endpoint time to process the images it already
    /// collected. Bounded by the drain window and by a stop request.
    async fn drain_analysis(&self) {
        let deadline = Instant::now() + self.settings.analysis_drain();
        let analysis = &self.lab.analysis;
        while analysis.in_flight() > 0 || analysis.pending() > 0 {
            if Instant::now() >= deadline {
                warn!("Analysis still busy after the drain window, stopping it");
                return;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(ANALYSIS_IDLE_POLL) => {}
            }
        }
        debug!("Analysis drained");
    }
}

fn publish_slot_paths(ctx: &SharedContext, paths: &SlotPaths, uid: Uuid) {
    ctx.set(Namespace::Measurement, Key::SlotFolder, &paths.root);
    ctx.set(Namespace::Measurement, Key::SlotCalibrationFolder, &paths.calibration);
    ctx.set(Namespace::Measurement, Key::SlotResultFolder, &paths.result);
    ctx.set(Namespace::Measurement, Key::SlotImagesFolder, &paths.images);
    ctx.set(Namespace::Measurement, Key::SlotResultDb, &paths.result_db);
    ctx.set(Namespace::Measurement, Key::CurrentResourceSpace, uid.to_string());
}

/// Drops a sample left over from an earlier slot when this slot starts the
/// device that produces it.
fn clear_stale_sample(ctx: &SharedContext, slot: &RoutineSlot, watched: Parameter) {
    let producer = match watched {
        Parameter::Temperature => Parameter::Temperature,
        Parameter::ResultNumber => Parameter::Algorithms,
        Parameter::Mfc => Parameter::Mfc,
        Parameter::Pump | Parameter::Camera | Parameter::Algorithms | Parameter::LightMode => return,
    };
    if slot.setting(producer).is_some() {
        if let Some((namespace, key)) = condition::sample_location(watched) {
            ctx.remove(namespace, key);
        }
    }
}

/// Writes the context values a payload's States read when they start.
pub(crate) fn stage(ctx: &SharedContext, payload: &SettingPayload, watched: Option<Parameter>) {
    match payload {
        SettingPayload::Temperature { target } => {
            ctx.set(Namespace::Thermostat, Key::TemperatureSetpoint, *target);
            ctx.set(
                Namespace::Thermostat,
                Key::LiveRecording,
                watched == Some(Parameter::Temperature),
            );
        }
        SettingPayload::Camera(capture) => {
            ctx.set(Namespace::Camera, Key::CaptureSettings, capture);
        }
        SettingPayload::MassFlow { massflow, interrupt } => {
            ctx.set(Namespace::Mfc, Key::MassflowSetpoint, *massflow);
            ctx.set(Namespace::Measurement, Key::MassflowInterrupt, *interrupt);
        }
        SettingPayload::Pump { volume, flow } => {
            ctx.set(Namespace::Pump, Key::PumpUnloadVolume, *volume);
            match flow {
                Some(flow) => ctx.set(Namespace::Pump, Key::PumpFlow, *flow),
                None => {
                    ctx.remove(Namespace::Pump, Key::PumpFlow);
                }
            }
        }
        SettingPayload::Light { mode } => match mode {
            LightMode::AlwaysOn | LightMode::AlwaysOff => {
                ctx.set(Namespace::Measurement, Key::LightMode, *mode == LightMode::AlwaysOn);
                ctx.set(Namespace::Measurement, Key::CameraLightSwitching, false);
            }
            LightMode::OnWhenNeeded => {
                ctx.set(Namespace::Measurement, Key::CameraLightSwitching, true);
            }
        },
        SettingPayload::Algorithm { .. } => {}
    }
}

/// Enqueues the States of a payload. Timed States run for `duration`.
pub(crate) fn dispatch(lab: &Lab, payload: &SettingPayload, duration: Duration) {
    match payload {
        SettingPayload::Temperature { .. } => {
            lab.thermostat.enqueue(ThermostatKind::SetTemperature, Duration::ZERO);
            lab.thermostat.enqueue(ThermostatKind::SensorPolling, duration);
        }
        SettingPayload::Camera(_) => lab.camera.enqueue(CameraKind::Capture, duration),
        SettingPayload::MassFlow { .. } => lab.mfc.enqueue(MfcKind::SetMassflow, Duration::ZERO),
        SettingPayload::Pump { .. } => lab.pump.enqueue(PumpKind::Dispense, Duration::ZERO),
        SettingPayload::Light { mode } => {
            if *mode != LightMode::OnWhenNeeded {
                lab.thermostat.enqueue(ThermostatKind::LightSwitch, Duration::ZERO);
            }
        }
        SettingPayload::Algorithm { algorithm } => {
            lab.analysis.enqueue(AnalysisKind::from(*algorithm), duration);
        }
    }
}

/// Endpoint a payload drives, if any.
pub(crate) fn payload_endpoint(payload: &SettingPayload) -> Option<EndpointId> {
    match payload {
        SettingPayload::Temperature { .. } => Some(EndpointId::Thermostat),
        SettingPayload::Camera(_) => Some(EndpointId::Camera),
        SettingPayload::MassFlow { .. } => Some(EndpointId::Mfc),
        SettingPayload::Pump { .. } => Some(EndpointId::Pump),
        SettingPayload::Light { mode } => (*mode != LightMode::OnWhenNeeded).then_some(EndpointId::Thermostat),
        SettingPayload::Algorithm { .. } => Some(EndpointId::Analysis),
    }
}

/// Endpoints driven by the settings of a slot or their subroutines, plus
/// the mass-flow controller when the slot condition reads it back.
fn touched_endpoints(slot: &RoutineSlot) -> BTreeSet<EndpointId> {
    let mut touched: BTreeSet<EndpointId> = slot
        .settings
        .iter()
        .flat_map(|setting| {
            std::iter::once(&setting.payload).chain(setting.subroutines.iter().map(|s| &s.payload))
        })
        .filter_map(payload_endpoint)
        .collect();
    if slot.condition.is_some_and(|c| c.parameter == Parameter::Mfc) {
        touched.insert(EndpointId::Mfc);
    }
    touched
}

/// Control surface of a running routine.
pub struct RoutineHandle {
    name: String,
    stop: CancellationToken,
    ctx: Arc<SharedContext>,
    progress: Arc<ProgressTracker>,
    reports: Arc<Mutex<Vec<SlotReport>>>,
    task: JoinHandle<RoutineOutcome>,
}

impl RoutineHandle {
    /// Name of the routine.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests a stop. The current slot resets and the rest are discarded.
    pub fn stop(&self) {
        info!(routine = %self.name, "Routine stop requested");
        self.stop.cancel();
    }

    /// Releases a slot waiting for the operator.
    pub fn acknowledge(&self) {
        self.ctx
            .set(Namespace::Measurement, Key::OperatorAcknowledged, true);
    }

    /// Progress spaces of the running slots.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Reports of the slots finished so far.
    pub fn reports(&self) -> Vec<SlotReport> {
        self.reports.lock().clone()
    }

    /// Whether the routine task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the routine to end. A panicked task counts as aborted.
    pub async fn join(self) -> RoutineOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(routine = %self.name, error = %e, "Routine task failed");
                RoutineOutcome::Aborted(e.to_string())
            }
        }
    }
}
