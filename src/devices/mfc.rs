//! Mass-flow controller endpoint.

use super::publish_connection;
use crate::config::MfcSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{Endpoint, EndpointController, EndpointId, State, StateKind, StateScope};
use crate::error::{AppResult, DaqError};
use crate::hardware::MassFlowHardware;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Controller driving the [`Mfc`].
pub type MfcController = EndpointController<Mfc>;

/// Flow restored by a valve toggle when no setpoint is known.
pub const DEFAULT_REOPEN_FLOW: f64 = 5.0;

/// Flows below this count as a closed valve.
const CLOSED_FLOW: f64 = 1e-3;

/// States of the mass flow endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfcKind {
    /// Reconnects the controller if it stopped answering.
    HealthCheck,
    /// Writes the setpoint from the context and checks it settled.
    SetMassflow,
    /// Publishes the measured flow to the context.
    ReadMassflow,
    /// Closes the valve when gas flows, reopens it otherwise.
    ValveToggle,
}

impl StateKind for MfcKind {
    fn label(&self) -> &'static str {
        match self {
            MfcKind::HealthCheck => "health_check",
            MfcKind::SetMassflow => "set_massflow",
            MfcKind::ReadMassflow => "read_massflow",
            MfcKind::ValveToggle => "valve_toggle",
        }
    }
}

/// Mass flow controller endpoint.
pub struct Mfc {
    hardware: Arc<dyn MassFlowHardware>,
    ctx: Arc<SharedContext>,
    settings: MfcSettings,
}

impl Mfc {
    /// Creates the endpoint over `hardware`.
    pub fn new(hardware: Arc<dyn MassFlowHardware>, ctx: Arc<SharedContext>, settings: MfcSettings) -> Self {
        Self {
            hardware,
            ctx,
            settings,
        }
    }

    async fn read_flow(&self) -> AppResult<f64> {
        self.hardware
            .measured_flow()
            .await?
            .ok_or(DaqError::NotConnected("mfc"))
    }
}

impl Endpoint for Mfc {
    type Kind = MfcKind;
    const ID: EndpointId = EndpointId::Mfc;
    const HEALTH_CHECK: Option<MfcKind> = Some(MfcKind::HealthCheck);

    fn build_state(endpoint: &Arc<Self>, kind: MfcKind) -> Option<Box<dyn State>> {
        let device = Arc::clone(endpoint);
        Some(match kind {
            MfcKind::HealthCheck => Box::new(HealthCheck(device)),
            MfcKind::SetMassflow => Box::new(SetMassflow(device)),
            MfcKind::ReadMassflow => Box::new(ReadMassflow(device)),
            MfcKind::ValveToggle => Box::new(ValveToggle(device)),
        })
    }
}

struct HealthCheck(Arc<Mfc>);

#[async_trait]
impl State for HealthCheck {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let mut healthy = matches!(device.hardware.measured_flow().await, Ok(Some(_)));
        if !healthy {
            match device.hardware.connect().await {
                Ok(()) => healthy = matches!(device.hardware.measured_flow().await, Ok(Some(_))),
                Err(e) => warn!(error = %e, "Mass-flow controller connection failed"),
            }
        }
        publish_connection(&device.ctx, EndpointId::Mfc, healthy);
        Ok(())
    }
}

/// Writes `Mfc/MassflowSetpoint`, reads back after settling and records in
/// `Mfc/MassflowApplied` whether the reading is within tolerance.
struct SetMassflow(Arc<Mfc>);

#[async_trait]
impl State for SetMassflow {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        device.ctx.set(Namespace::Mfc, Key::MassflowApplied, false);
        let Some(setpoint) = device.ctx.get::<f64>(Namespace::Mfc, Key::MassflowSetpoint) else {
            warn!("No mass-flow setpoint in context");
            return Ok(());
        };

        device.hardware.write_setpoint(setpoint).await?;
        if !scope.pause(Duration::from_millis(device.settings.settle_ms)).await {
            return Ok(());
        }
        let measured = device.read_flow().await?;
        let applied = (measured - setpoint).abs() < device.settings.setpoint_tolerance;
        device.ctx.set(Namespace::Mfc, Key::MassflowApplied, applied);
        device.ctx.set(Namespace::Mfc, Key::LiveMassflow, measured);

        if applied {
            info!(setpoint, measured, "Mass flow applied");
        } else {
            warn!(setpoint, measured, "Mass flow outside tolerance");
        }
        Ok(())
    }
}

struct ReadMassflow(Arc<Mfc>);

#[async_trait]
impl State for ReadMassflow {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let measured = self.0.read_flow().await?;
        debug!(measured, "Mass flow read");
        self.0.ctx.set(Namespace::Mfc, Key::LiveMassflow, measured);
        Ok(())
    }
}

struct ValveToggle(Arc<Mfc>);

#[async_trait]
impl State for ValveToggle {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        let measured = device.read_flow().await?;
        if measured > CLOSED_FLOW {
            device.hardware.write_setpoint(0.0).await?;
            debug!(measured, "Valve closed");
        } else {
            let reopen = device
                .ctx
                .get::<f64>(Namespace::Mfc, Key::MassflowSetpoint)
                .unwrap_or(DEFAULT_REOPEN_FLOW);
            device.hardware.write_setpoint(reopen).await?;
            debug!(reopen, "Valve reopened");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSettings;
    use crate::hardware::mock::MockMassFlow;

    fn setup() -> (Arc<MockMassFlow>, Arc<SharedContext>, Arc<MfcController>) {
        let hardware = Arc::new(MockMassFlow::new());
        let ctx = Arc::new(SharedContext::new());
        let device = Mfc::new(hardware.clone(), Arc::clone(&ctx), MfcSettings::default());
        let controller = EndpointController::spawn(Arc::new(device), 2, &EndpointSettings::default());
        (hardware, ctx, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_massflow_within_tolerance() {
        let (hardware, ctx, ctl) = setup();
        hardware.set_offset(1.0);
        ctx.set(Namespace::Mfc, Key::MassflowSetpoint, 10.0);
        ctl.enqueue(MfcKind::SetMassflow, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(hardware.setpoint(), 10.0);
        assert!(ctx.flag(Namespace::Mfc, Key::MassflowApplied));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_massflow_outside_tolerance() {
        let (hardware, ctx, ctl) = setup();
        hardware.set_offset(3.0);
        ctx.set(Namespace::Mfc, Key::MassflowSetpoint, 10.0);
        ctl.enqueue(MfcKind::SetMassflow, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!ctx.flag(Namespace::Mfc, Key::MassflowApplied));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_massflow_without_setpoint_is_not_applied() {
        let (hardware, ctx, ctl) = setup();
        ctl.enqueue(MfcKind::SetMassflow, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(hardware.writes().is_empty());
        assert!(ctx.contains(Namespace::Mfc, Key::MassflowApplied));
        assert!(!ctx.flag(Namespace::Mfc, Key::MassflowApplied));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_toggle_closes_then_reopens() {
        let (hardware, ctx, ctl) = setup();
        ctx.set(Namespace::Mfc, Key::MassflowSetpoint, 8.0);
        hardware.write_setpoint(8.0).await.unwrap();

        ctl.enqueue(MfcKind::ValveToggle, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hardware.setpoint(), 0.0);

        ctl.enqueue(MfcKind::ValveToggle, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hardware.setpoint(), 8.0);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_reopens_to_default_without_setpoint() {
        let (hardware, _ctx, ctl) = setup();
        ctl.enqueue(MfcKind::ValveToggle, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hardware.setpoint(), DEFAULT_REOPEN_FLOW);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reconnects_unreachable_device() {
        let (hardware, ctx, ctl) = setup();
        ctl.enqueue(MfcKind::HealthCheck, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctx.flag(Namespace::Devices, Key::Connected(EndpointId::Mfc)));

        hardware.disconnect();
        ctx.set(Namespace::Devices, Key::Connected(EndpointId::Mfc), false);
        ctl.enqueue(MfcKind::HealthCheck, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // The mock reconnects on request.
        assert!(ctx.flag(Namespace::Devices, Key::Connected(EndpointId::Mfc)));
        ctl.shutdown().await;
    }
}
