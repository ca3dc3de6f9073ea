//! Camera endpoint.
//!
//! A capture run grabs bursts of frames on the slot's interval, writes them to
//! the slot's image folder and registers every file in the current resource
//! space, where the analysis engine picks them up. When light switching is on
//! the sample light is switched through the thermostat around each burst, and
//! a mass-flow interrupt pauses the gas for the duration of the burst.

use super::mfc::{MfcController, MfcKind};
use super::publish_connection;
use super::thermostat::{ThermostatController, ThermostatKind};
use crate::config::ThermostatSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{
    Endpoint, EndpointController, EndpointId, PeriodicJob, Schedule, StartGate, State, StateKind,
    StateScope,
};
use crate::error::AppResult;
use crate::hardware::{CameraDeviceSettings, CameraHardware, Frame};
use crate::resources::ResourceRegistry;
use crate::routine::CaptureSettings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller driving the [`Camera`].
pub type CameraController = EndpointController<Camera>;

const LIVE_VIEW_POLL: Duration = Duration::from_millis(250);
/// Bound on waiting for a cut-short burst to restore light and valve.
const BURST_GRACE: Duration = Duration::from_secs(5);

/// States of the camera endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraKind {
    /// Probes the camera and reconnects it if needed.
    HealthCheck,
    /// Captures image bursts for the current slot.
    Capture,
    /// Saves a single calibration frame.
    CalibrationCapture,
    /// Writes the device settings from the context.
    ApplySettings,
    /// Streams frames until another camera task arrives.
    LiveView,
}

impl StateKind for CameraKind {
    fn label(&self) -> &'static str {
        match self {
            CameraKind::HealthCheck => "health_check",
            CameraKind::Capture => "capture",
            CameraKind::CalibrationCapture => "calibration_capture",
            CameraKind::ApplySettings => "apply_settings",
            CameraKind::LiveView => "live_view",
        }
    }
}

/// Industrial camera endpoint.
pub struct Camera {
    hardware: Arc<dyn CameraHardware>,
    ctx: Arc<SharedContext>,
    resources: Arc<dyn ResourceRegistry>,
    capture_gate: StartGate,
    thermostat: Arc<ThermostatController>,
    mfc: Arc<MfcController>,
    light: ThermostatSettings,
    /// Ends a running live view.
    preempt: Notify,
}

impl Camera {
    /// The camera switches the light through `thermostat` and interrupts
    /// the gas flow through `mfc`.
    pub fn new(
        hardware: Arc<dyn CameraHardware>,
        ctx: Arc<SharedContext>,
        resources: Arc<dyn ResourceRegistry>,
        thermostat: Arc<ThermostatController>,
        mfc: Arc<MfcController>,
    ) -> Self {
        let light = thermostat.endpoint().settings().clone();
        Self {
            hardware,
            ctx,
            resources,
            capture_gate: StartGate::new(),
            thermostat,
            mfc,
            light,
            preempt: Notify::new(),
        }
    }

    /// Gate released by the engine when capturing should begin.
    pub fn capture_gate(&self) -> &StartGate {
        &self.capture_gate
    }

    /// Streams one frame and closes the stream again.
    async fn probe(&self) -> AppResult<Option<Frame>> {
        self.hardware.stream_on().await?;
        let frame = self.hardware.grab().await;
        self.hardware.stream_off().await?;
        frame
    }

    fn switch_light(&self, on: bool) {
        self.ctx.set(Namespace::Measurement, Key::LightMode, on);
        self.thermostat.enqueue(ThermostatKind::LightSwitch, Duration::ZERO);
    }

    /// One burst of `plan.images` frames. A cancelled burst skips its
    /// remaining frames but still switches the light off and reopens the
    /// valve it closed.
    async fn burst(&self, plan: &CapturePlan, burst: u32, stop: &CancellationToken) {
        if stop.is_cancelled() {
            return;
        }
        if plan.interrupt_flow {
            self.mfc.enqueue(MfcKind::ValveToggle, Duration::ZERO);
        }
        if plan.light_switching {
            self.switch_light(true);
            let settle = Duration::from_millis(self.light.light_settle_ms);
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(settle) => {}
            }
        }

        let stamp = chrono::Local::now().format("%H_%M_%S").to_string();
        let mut saved = 0;
        for i in 0..plan.images {
            if stop.is_cancelled() {
                debug!(burst, image = i, "Capture burst cut short");
                break;
            }
            let name = format!("Image_{stamp}_{burst}_{i}.raw");
            match self.capture_to(&plan.folder.join(&name)).await {
                Ok(Some(path)) => {
                    self.resources.register(&plan.space, &name, path);
                    saved += 1;
                }
                Ok(None) => warn!(burst, image = i, "No data received from capture stream"),
                Err(e) => warn!(burst, image = i, error = %e, "Image capture failed"),
            }
        }
        debug!(burst, saved, requested = plan.images, "Capture burst done");

        if plan.light_switching {
            self.switch_light(false);
        }
        if plan.interrupt_flow {
            self.mfc.enqueue(MfcKind::ValveToggle, Duration::ZERO);
        }
    }

    /// Grabs a frame from the open stream and saves it to `path`.
    async fn capture_to(&self, path: &Path) -> AppResult<Option<PathBuf>> {
        let Some(frame) = self.hardware.grab().await? else {
            return Ok(None);
        };
        frame.save(path).await?;
        Ok(Some(path.to_path_buf()))
    }
}

impl Endpoint for Camera {
    type Kind = CameraKind;
    const ID: EndpointId = EndpointId::Camera;
    const HEALTH_CHECK: Option<CameraKind> = Some(CameraKind::HealthCheck);

    fn build_state(endpoint: &Arc<Self>, kind: CameraKind) -> Option<Box<dyn State>> {
        let device = Arc::clone(endpoint);
        if kind != CameraKind::LiveView {
            device.preempt.notify_waiters();
        }
        Some(match kind {
            CameraKind::HealthCheck => Box::new(HealthCheck(device)),
            CameraKind::Capture => Box::new(Capture {
                device,
                streaming: false,
                light_switching: false,
            }),
            CameraKind::CalibrationCapture => Box::new(CalibrationCapture(device)),
            CameraKind::ApplySettings => Box::new(ApplySettings(device)),
            CameraKind::LiveView => Box::new(LiveView(device)),
        })
    }
}

struct HealthCheck(Arc<Camera>);

#[async_trait]
impl State for HealthCheck {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let camera = &self.0;
        let mut healthy = false;
        if camera.hardware.is_connected().await {
            healthy = matches!(camera.probe().await, Ok(Some(_)));
        }
        if !healthy {
            match camera.hardware.connect().await {
                Ok(()) => healthy = matches!(camera.probe().await, Ok(Some(_))),
                Err(e) => warn!(error = %e, "Could not connect to camera"),
            }
        }
        publish_connection(&camera.ctx, EndpointId::Camera, healthy);
        Ok(())
    }
}

#[derive(Debug)]
struct CapturePlan {
    images: u32,
    folder: PathBuf,
    space: String,
    light_switching: bool,
    interrupt_flow: bool,
}

/// Timed multi-burst capture, started by the capture gate and ended by the
/// deadline or cancellation.
struct Capture {
    device: Arc<Camera>,
    streaming: bool,
    light_switching: bool,
}

#[async_trait]
impl State for Capture {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let camera = Arc::clone(&self.device);
        let settings: CaptureSettings = camera.ctx.require(Namespace::Camera, Key::CaptureSettings)?;
        let folder: PathBuf = camera.ctx.require(Namespace::Measurement, Key::SlotImagesFolder)?;
        let space: String = camera
            .ctx
            .require(Namespace::Measurement, Key::CurrentResourceSpace)?;

        let min_interval = Duration::from_secs(camera.light.light_switch_min_interval_secs);
        let wants_switching = camera.ctx.flag(Namespace::Measurement, Key::CameraLightSwitching);
        if wants_switching && settings.interval < min_interval {
            warn!(
                interval = ?settings.interval,
                ?min_interval,
                "Capture interval too short for light switching, keeping the light as is"
            );
        }
        self.light_switching = wants_switching && settings.interval >= min_interval;

        let plan = Arc::new(CapturePlan {
            images: settings.images_per_interval,
            folder,
            space,
            light_switching: self.light_switching,
            interrupt_flow: camera.ctx.flag(Namespace::Measurement, Key::MassflowInterrupt),
        });

        if !scope.wait_gate(&camera.capture_gate).await {
            return Ok(());
        }
        camera.hardware.stream_on().await?;
        self.streaming = true;
        info!(images = plan.images, interval = ?settings.interval, "Image capture started");

        let mut count = 0u32;
        let bursts = scope.child_token();
        let job = PeriodicJob::spawn(
            "camera_capture",
            Schedule::every(settings.interval).delayed().until(scope.deadline()),
            bursts.clone(),
            move || {
                count += 1;
                let burst = count;
                let camera = Arc::clone(&camera);
                let plan = Arc::clone(&plan);
                let stop = bursts.clone();
                async move { camera.burst(&plan, burst, &stop).await }
            },
        );
        scope.pause_until_deadline().await;
        if !job.finish(BURST_GRACE).await {
            warn!("Capture burst did not wind down in time");
        }
        Ok(())
    }

    async fn on_exit(&mut self, _scope: &StateScope) {
        if self.light_switching {
            self.device.switch_light(false);
        }
        if self.streaming {
            if let Err(e) = self.device.hardware.stream_off().await {
                warn!(error = %e, "Failed to close camera stream");
            }
            info!("Image capture finished");
        }
    }
}

/// Single frame into the slot's calibration folder.
struct CalibrationCapture(Arc<Camera>);

#[async_trait]
impl State for CalibrationCapture {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let camera = &self.0;
        let folder: PathBuf = camera
            .ctx
            .require(Namespace::Measurement, Key::SlotCalibrationFolder)?;
        let Some(frame) = camera.probe().await? else {
            warn!("No data received for calibration image");
            return Ok(());
        };

        let stamp = chrono::Local::now().format("%H_%M_%S").to_string();
        let path = folder.join(format!("Calibration_{stamp}.raw"));
        frame.save(&path).await?;
        camera
            .ctx
            .set(Namespace::Measurement, Key::CalibrationImagePath, &path);
        info!(path = %path.display(), "Calibration image saved");
        Ok(())
    }
}

struct ApplySettings(Arc<Camera>);

#[async_trait]
impl State for ApplySettings {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let camera = &self.0;
        camera
            .ctx
            .set(Namespace::Camera, Key::CameraDeviceSettingsApplied, false);
        let requested: CameraDeviceSettings = camera
            .ctx
            .require(Namespace::Camera, Key::CameraDeviceSettings)?;
        let readback = camera.hardware.apply_settings(&requested).await?;

        let applied = readback == requested;
        if !applied {
            warn!(?requested, ?readback, "Camera did not accept all settings");
        }
        camera
            .ctx
            .set(Namespace::Camera, Key::CameraDeviceSettingsApplied, applied);
        Ok(())
    }
}

/// Keeps the stream open until cancelled or another camera task arrives.
struct LiveView(Arc<Camera>);

#[async_trait]
impl State for LiveView {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let camera = &self.0;
        camera.hardware.stream_on().await?;
        info!("Camera in live mode");
        while !scope.is_cancelled() && !scope.has_pending_work() {
            tokio::select! {
                _ = camera.preempt.notified() => break,
                _ = scope.pause(LIVE_VIEW_POLL) => {}
            }
        }
        Ok(())
    }

    async fn on_exit(&mut self, _scope: &StateScope) {
        if let Err(e) = self.0.hardware.stream_off().await {
            warn!(error = %e, "Failed to close camera stream");
        }
        info!("Camera left live mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointSettings, MfcSettings};
    use crate::devices::mfc::Mfc;
    use crate::devices::thermostat::Thermostat;
    use crate::hardware::mock::{MockCamera, MockMassFlow, MockThermostatLink};
    use crate::hardware::MassFlowHardware;
    use crate::resources::InMemoryResourceRegistry;

    struct Rig {
        camera: Arc<MockCamera>,
        link: Arc<MockThermostatLink>,
        flow: Arc<MockMassFlow>,
        ctx: Arc<SharedContext>,
        resources: Arc<InMemoryResourceRegistry>,
        ctl: Arc<CameraController>,
        thermostat: Arc<ThermostatController>,
        mfc: Arc<MfcController>,
        dir: tempfile::TempDir,
    }

    impl Rig {
        fn new(camera: MockCamera) -> Self {
            let settings = EndpointSettings::default();
            let ctx = Arc::new(SharedContext::new());
            let resources = Arc::new(InMemoryResourceRegistry::new());
            let camera = Arc::new(camera);
            let link = Arc::new(MockThermostatLink::new(20.0));
            let flow = Arc::new(MockMassFlow::new());

            let thermostat = EndpointController::spawn(
                Arc::new(Thermostat::new(link.clone(), Arc::clone(&ctx), ThermostatSettings::default())),
                2,
                &settings,
            );
            let mfc = EndpointController::spawn(
                Arc::new(Mfc::new(flow.clone(), Arc::clone(&ctx), MfcSettings::default())),
                2,
                &settings,
            );
            let device = Camera::new(
                camera.clone(),
                Arc::clone(&ctx),
                resources.clone(),
                Arc::clone(&thermostat),
                Arc::clone(&mfc),
            );
            let ctl = EndpointController::spawn(Arc::new(device), 5, &settings);
            Self {
                camera,
                link,
                flow,
                ctx,
                resources,
                ctl,
                thermostat,
                mfc,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn prepare_capture(&self, images: u32, interval: Duration) {
            self.ctx.set(
                Namespace::Camera,
                Key::CaptureSettings,
                CaptureSettings {
                    images_per_interval: images,
                    interval,
                },
            );
            self.ctx
                .set(Namespace::Measurement, Key::SlotImagesFolder, self.dir.path());
            self.ctx
                .set(Namespace::Measurement, Key::CurrentResourceSpace, "slot-1");
        }

        async fn shutdown(self) {
            self.ctl.shutdown().await;
            self.thermostat.shutdown().await;
            self.mfc.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_registers_bursts() {
        let rig = Rig::new(MockCamera::new());
        rig.prepare_capture(3, Duration::from_secs(2));
        rig.ctl.enqueue(CameraKind::Capture, Duration::from_secs(7));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rig.camera.is_streaming());

        rig.ctl.endpoint().capture_gate().open();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Bursts at +2s, +4s and +6s.
        let images = rig.resources.resources("slot-1").unwrap();
        assert_eq!(images.len(), 9);
        assert!(images.iter().all(|r| r.path.exists()));
        assert!(!rig.camera.is_streaming());
        assert!(rig.ctl.is_idle());
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_skips_empty_frames() {
        let rig = Rig::new(MockCamera::new());
        rig.camera.fail_next_grabs(2);
        rig.prepare_capture(4, Duration::from_secs(1));
        rig.ctl.endpoint().capture_gate().open();
        rig.ctl.enqueue(CameraKind::Capture, Duration::from_millis(1500));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(rig.resources.resources("slot-1").unwrap().len(), 2);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_switches_light_and_interrupts_flow() {
        let rig = Rig::new(MockCamera::new());
        rig.prepare_capture(1, Duration::from_secs(10));
        rig.ctx
            .set(Namespace::Measurement, Key::CameraLightSwitching, true);
        rig.ctx.set(Namespace::Measurement, Key::MassflowInterrupt, true);
        rig.ctx.set(Namespace::Mfc, Key::MassflowSetpoint, 6.0);
        rig.flow.write_setpoint(6.0).await.unwrap();
        rig.ctl.endpoint().capture_gate().open();
        rig.ctl.enqueue(CameraKind::Capture, Duration::from_secs(15));

        // First burst at +10s; the light settles for 3s before grabbing.
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        assert!(rig.link.light());
        assert_eq!(rig.flow.setpoint(), 0.0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!rig.link.light());
        assert_eq!(rig.flow.setpoint(), 6.0);
        assert_eq!(rig.resources.resources("slot-1").unwrap().len(), 1);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_interval_disables_light_switching() {
        let rig = Rig::new(MockCamera::new());
        rig.prepare_capture(1, Duration::from_secs(1));
        rig.ctx
            .set(Namespace::Measurement, Key::CameraLightSwitching, true);
        rig.ctl.endpoint().capture_gate().open();
        rig.ctl.enqueue(CameraKind::Capture, Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(!rig.link.commands().contains(&"S".to_string()));
        assert_eq!(rig.resources.resources("slot-1").unwrap().len(), 2);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_stream() {
        let rig = Rig::new(MockCamera::new());
        rig.prepare_capture(1, Duration::from_secs(1));
        rig.ctl.endpoint().capture_gate().open();
        rig.ctl.enqueue(CameraKind::Capture, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rig.camera.is_streaming());

        rig.ctl.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rig.camera.is_streaming());
        assert!(rig.ctl.is_idle());
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reconnects() {
        let rig = Rig::new(MockCamera::disconnected());
        rig.ctl.enqueue(CameraKind::HealthCheck, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(rig.ctx.flag(Namespace::Devices, Key::Connected(EndpointId::Camera)));
        assert_eq!(rig.camera.connect_attempts(), 1);
        assert!(!rig.camera.is_streaming());
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_unplugged_camera() {
        let rig = Rig::new(MockCamera::new());
        rig.camera.unplug();
        rig.ctl.enqueue(CameraKind::HealthCheck, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!rig.ctx.flag(Namespace::Devices, Key::Connected(EndpointId::Camera)));
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_capture_records_path() {
        let rig = Rig::new(MockCamera::new());
        rig.ctx
            .set(Namespace::Measurement, Key::SlotCalibrationFolder, rig.dir.path());
        rig.ctl.enqueue(CameraKind::CalibrationCapture, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let path: PathBuf = rig
            .ctx
            .get(Namespace::Measurement, Key::CalibrationImagePath)
            .unwrap();
        assert!(path.exists());
        assert!(path.starts_with(rig.dir.path()));
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_settings_reports_readback_mismatch() {
        let rig = Rig::new(MockCamera::new());
        let mut requested = CameraDeviceSettings::default();
        requested.gain = 12.0;
        rig.ctx
            .set(Namespace::Camera, Key::CameraDeviceSettings, requested);
        rig.ctl.enqueue(CameraKind::ApplySettings, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.ctx.flag(Namespace::Camera, Key::CameraDeviceSettingsApplied));

        requested.gain = 30.0;
        rig.ctx
            .set(Namespace::Camera, Key::CameraDeviceSettings, requested);
        rig.ctl.enqueue(CameraKind::ApplySettings, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rig.ctx.flag(Namespace::Camera, Key::CameraDeviceSettingsApplied));
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_view_ends_when_other_work_arrives() {
        let rig = Rig::new(MockCamera::new());
        rig.ctl.enqueue(CameraKind::LiveView, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rig.camera.is_streaming());
        assert_eq!(rig.ctl.current_state_kind(), Some(CameraKind::LiveView));

        rig.ctl.enqueue(CameraKind::HealthCheck, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!rig.camera.is_streaming());
        assert!(rig.ctl.is_idle());
        rig.shutdown().await;
    }
}
