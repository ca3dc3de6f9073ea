//! Device supervisor.
//!
//! Runs one health round per task: devices whose connection flag is set are
//! listed under `Controller/ConnectedDevices`, the others get a health check
//! enqueued. Rounds are skipped while a measurement runs so probes never
//! interfere with a capture.

use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{ControlHandle, Endpoint, EndpointController, EndpointId, State, StateKind, StateScope};
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Controller driving the [`DeviceSupervisor`].
pub type SupervisorController = EndpointController<DeviceSupervisor>;

/// States of the device supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorKind {
    /// One health check round over every device.
    HealthCheck,
}

impl StateKind for SupervisorKind {
    fn label(&self) -> &'static str {
        match self {
            SupervisorKind::HealthCheck => "health_check",
        }
    }
}

/// Periodic health checks over the device endpoints.
pub struct DeviceSupervisor {
    ctx: Arc<SharedContext>,
    devices: Vec<Arc<dyn ControlHandle>>,
}

impl DeviceSupervisor {
    /// Marks every device disconnected and no measurement running, so the
    /// first round probes everything.
    pub fn new(ctx: Arc<SharedContext>, devices: Vec<Arc<dyn ControlHandle>>) -> Self {
        for device in &devices {
            ctx.set(Namespace::Devices, Key::Connected(device.id()), false);
        }
        ctx.set(Namespace::Measurement, Key::MeasurementRunning, false);
        Self { ctx, devices }
    }

    /// Supervised endpoints, in check order.
    pub fn devices(&self) -> &[Arc<dyn ControlHandle>] {
        &self.devices
    }
}

impl Endpoint for DeviceSupervisor {
    type Kind = SupervisorKind;
    const ID: EndpointId = EndpointId::DeviceSupervisor;

    fn build_state(endpoint: &Arc<Self>, kind: SupervisorKind) -> Option<Box<dyn State>> {
        match kind {
            SupervisorKind::HealthCheck => Some(Box::new(HealthRound(Arc::clone(endpoint)))),
        }
    }
}

struct HealthRound(Arc<DeviceSupervisor>);

#[async_trait]
impl State for HealthRound {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let supervisor = &self.0;
        if supervisor.ctx.flag(Namespace::Measurement, Key::MeasurementRunning) {
            debug!("Measurement running, skipping health round");
            return Ok(());
        }

        let mut connected = Vec::new();
        for device in &supervisor.devices {
            let id = device.id();
            if supervisor.ctx.flag(Namespace::Devices, Key::Connected(id)) {
                connected.push(id.name().to_string());
            } else if device.request_health_check() {
                debug!(device = id.name(), "Health check requested");
            }
        }
        supervisor
            .ctx
            .set(Namespace::Controller, Key::ConnectedDevices, connected);
        Ok(())
    }
}
