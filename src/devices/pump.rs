//! Syringe pump endpoint.
//!
//! Load and dispense are fire-and-wait: the command is sent, then the fill
//! level is polled until it reaches the target or the expected pumping time
//! (plus a second of slack) has passed. A cancelled run stops the drive on
//! exit.

use super::publish_connection;
use crate::config::PumpSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{Endpoint, EndpointController, EndpointId, State, StateKind, StateScope};
use crate::error::{AppResult, DaqError};
use crate::hardware::PumpHardware;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Controller driving the [`Pump`].
pub type PumpController = EndpointController<Pump>;

const LEVEL_POLL: Duration = Duration::from_millis(500);
const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// States of the syringe pump endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpKind {
    /// Checks the pump is enabled.
    HealthCheck,
    /// Aspirates the load volume from the context.
    Load,
    /// Dispenses the unload volume from the context.
    Dispense,
    /// Runs the pump's calibration and waits for it.
    Calibrate,
    /// Writes the syringe geometry from the context.
    ConfigureSyringe,
}

impl StateKind for PumpKind {
    fn label(&self) -> &'static str {
        match self {
            PumpKind::HealthCheck => "health_check",
            PumpKind::Load => "load",
            PumpKind::Dispense => "dispense",
            PumpKind::Calibrate => "calibrate",
            PumpKind::ConfigureSyringe => "configure_syringe",
        }
    }
}

/// Syringe pump endpoint.
pub struct Pump {
    hardware: Arc<dyn PumpHardware>,
    ctx: Arc<SharedContext>,
    settings: PumpSettings,
}

impl Pump {
    /// Creates the endpoint over `hardware`.
    pub fn new(hardware: Arc<dyn PumpHardware>, ctx: Arc<SharedContext>, settings: PumpSettings) -> Self {
        Self {
            hardware,
            ctx,
            settings,
        }
    }

    /// Polls the fill level until it is within tolerance of `target`.
    /// Returns `false` on timeout or cancellation.
    async fn wait_for_level(&self, scope: &StateScope, target: f64, volume: f64, flow: f64) -> AppResult<bool> {
        let expected = Duration::from_secs_f64(volume / flow) + Duration::from_secs(1);
        let give_up = Instant::now() + expected;
        loop {
            let level = self.hardware.fill_level().await?;
            if (level - target).abs() <= self.settings.volume_tolerance_ul {
                debug!(level, target, "Fill level reached");
                return Ok(true);
            }
            if Instant::now() >= give_up {
                warn!(level, target, ?expected, "Pump did not reach target level in time");
                return Ok(false);
            }
            if !scope.pause(LEVEL_POLL).await {
                return Ok(false);
            }
        }
    }
}

impl Endpoint for Pump {
    type Kind = PumpKind;
    const ID: EndpointId = EndpointId::Pump;
    const HEALTH_CHECK: Option<PumpKind> = Some(PumpKind::HealthCheck);

    fn build_state(endpoint: &Arc<Self>, kind: PumpKind) -> Option<Box<dyn State>> {
        let device = Arc::clone(endpoint);
        Some(match kind {
            PumpKind::HealthCheck => Box::new(HealthCheck(device)),
            PumpKind::Load => Box::new(Load(device)),
            PumpKind::Dispense => Box::new(Dispense(device)),
            PumpKind::Calibrate => Box::new(Calibrate(device)),
            PumpKind::ConfigureSyringe => Box::new(ConfigureSyringe(device)),
        })
    }
}

struct HealthCheck(Arc<Pump>);

#[async_trait]
impl State for HealthCheck {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let mut enabled = device.hardware.is_enabled().await.unwrap_or(false);
        if !enabled {
            let restart = async {
                device.hardware.connect().await?;
                device.hardware.start().await?;
                device.hardware.is_enabled().await
            };
            enabled = match restart.await {
                Ok(enabled) => enabled,
                Err(e) => {
                    warn!(error = %e, "Pump restart failed");
                    false
                }
            };
        }
        publish_connection(&device.ctx, EndpointId::Pump, enabled);
        Ok(())
    }
}

/// Aspirates `Pump/PumpLoadVolume` at maximum flow, limited by the free
/// syringe capacity.
struct Load(Arc<Pump>);

#[async_trait]
impl State for Load {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let requested: f64 = device.ctx.require(Namespace::Pump, Key::PumpLoadVolume)?;
        let level = device.hardware.fill_level().await?;
        let max_volume = device.hardware.max_volume().await?;
        let flow = device.hardware.max_flow().await?;

        let volume = requested.min(max_volume).min(max_volume - level).max(0.0);
        if volume < requested {
            warn!(requested, volume, level, max_volume, "Load volume limited by syringe capacity");
        }
        if volume <= 0.0 {
            info!("Syringe full, nothing to load");
            return Ok(());
        }
        if flow <= 0.0 {
            return Err(DaqError::Instrument(format!("pump reports flow {flow}")));
        }

        device.hardware.aspirate(volume, flow).await?;
        info!(volume, flow, "Loading fluid");
        device.wait_for_level(scope, level + volume, volume, flow).await?;
        Ok(())
    }

    async fn on_exit(&mut self, scope: &StateScope) {
        stop_if_cancelled(&self.0, scope).await;
    }
}

/// Dispenses `Pump/PumpUnloadVolume` at `Pump/PumpFlow`. A missing or zero
/// flow means maximum flow.
struct Dispense(Arc<Pump>);

#[async_trait]
impl State for Dispense {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let requested: f64 = device.ctx.require(Namespace::Pump, Key::PumpUnloadVolume)?;
        let max_flow = device.hardware.max_flow().await?;
        let flow = match device.ctx.get::<f64>(Namespace::Pump, Key::PumpFlow) {
            Some(flow) if flow > 0.0 => flow.min(max_flow),
            _ => max_flow,
        };
        let level = device.hardware.fill_level().await?;

        let volume = requested.min(level).max(0.0);
        if volume < requested {
            warn!(requested, volume, "Dispense volume limited by fill level");
        }
        if volume <= 0.0 {
            info!("Syringe empty, nothing to dispense");
            return Ok(());
        }
        if flow <= 0.0 {
            return Err(DaqError::Instrument(format!("pump reports flow {flow}")));
        }

        device.hardware.dispense(volume, flow).await?;
        info!(volume, flow, "Dispensing fluid");
        device.wait_for_level(scope, level - volume, volume, flow).await?;
        Ok(())
    }

    async fn on_exit(&mut self, scope: &StateScope) {
        stop_if_cancelled(&self.0, scope).await;
    }
}

async fn stop_if_cancelled(device: &Pump, scope: &StateScope) {
    if scope.is_cancelled() {
        match device.hardware.stop_pumping().await {
            Ok(()) => info!("Pumping stopped"),
            Err(e) => error!(error = %e, "Failed to stop pump"),
        }
    }
}

struct Calibrate(Arc<Pump>);

#[async_trait]
impl State for Calibrate {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        device.hardware.calibrate().await?;
        let give_up = Instant::now() + CALIBRATION_TIMEOUT;
        while Instant::now() < give_up {
            if device.hardware.is_calibration_finished().await? {
                info!("Pump calibrated");
                return Ok(());
            }
            if !scope.pause(LEVEL_POLL).await {
                return Ok(());
            }
        }
        Err(DaqError::Instrument("pump calibration timed out".into()))
    }
}

/// Applies `Pump/SyringeDiameter` and `Pump/SyringeLength`, falling back to
/// the configured syringe.
struct ConfigureSyringe(Arc<Pump>);

#[async_trait]
impl State for ConfigureSyringe {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let diameter = device
            .ctx
            .get::<f64>(Namespace::Pump, Key::SyringeDiameter)
            .unwrap_or(device.settings.syringe_diameter_mm);
        let length = device
            .ctx
            .get::<f64>(Namespace::Pump, Key::SyringeLength)
            .unwrap_or(device.settings.syringe_length_mm);
        if !(diameter > 0.0 && length > 0.0) {
            return Err(DaqError::Configuration(format!(
                "invalid syringe {diameter} mm x {length} mm"
            )));
        }
        device.hardware.set_syringe(diameter, length).await?;
        info!(diameter, length, "Syringe configured");
        Ok(())
    }
}
