//! Device registry.
//!
//! Owns every endpoint controller together with the shared context, the
//! resource registry and the event bus, and wires them in a fixed order:
//! thermostat and mass-flow controller first (the camera drives both), then
//! camera, pump and analysis, then the supervisor watching the four devices.
//! The routine engine borrows the registry; nothing is reached through
//! globals.

use crate::config::Settings;
use crate::context::SharedContext;
use crate::devices::{
    AnalysisController, AnalysisEngine, Camera, CameraController, DeviceSupervisor, ImageAnalyzer, Mfc,
    MfcController, Pump, PumpController, SupervisorController, SupervisorKind, Thermostat,
    ThermostatController,
};
use crate::endpoint::{ControlHandle, EndpointController, EndpointId, PeriodicJob, Schedule, StartGate};
use crate::events::EventBus;
use crate::hardware::mock::{MockAnalyzer, MockCamera, MockMassFlow, MockPump, MockThermostatLink};
use crate::hardware::{CameraHardware, MassFlowHardware, PumpHardware, SerialLink};
use crate::resources::ResourceRegistry;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Hardware behind the device endpoints.
pub struct Hardware {
    /// Camera driver.
    pub camera: Arc<dyn CameraHardware>,
    /// Thermostat board link.
    pub thermostat: Arc<dyn SerialLink>,
    /// Mass flow controller driver.
    pub mfc: Arc<dyn MassFlowHardware>,
    /// Syringe pump driver.
    pub pump: Arc<dyn PumpHardware>,
    /// Image analysis backend.
    pub analyzer: Arc<dyn ImageAnalyzer>,
}

impl Hardware {
    /// Simulated devices: a room-temperature thermostat and a half-full syringe.
    pub fn simulated() -> Self {
        Self {
            camera: Arc::new(MockCamera::new()),
            thermostat: Arc::new(MockThermostatLink::new(21.0)),
            mfc: Arc::new(MockMassFlow::new()),
            pump: Arc::new(MockPump::new(500.0)),
            analyzer: Arc::new(MockAnalyzer::new()),
        }
    }
}

/// Every endpoint of the setup, sharing one context and resource registry.
pub struct Lab {
    ctx: Arc<SharedContext>,
    resources: Arc<dyn ResourceRegistry>,
    events: EventBus,
    /// Camera endpoint.
    pub camera: Arc<CameraController>,
    /// Thermostat endpoint.
    pub thermostat: Arc<ThermostatController>,
    /// Mass flow endpoint.
    pub mfc: Arc<MfcController>,
    /// Syringe pump endpoint.
    pub pump: Arc<PumpController>,
    /// Image analysis endpoint.
    pub analysis: Arc<AnalysisController>,
    /// Device supervisor.
    pub supervisor: Arc<SupervisorController>,
    health: Mutex<Option<PeriodicJob>>,
    health_cancel: CancellationToken,
}

impl Lab {
    /// Spawns every endpoint. Must be called inside a tokio runtime.
    pub fn start(settings: &Settings, hardware: Hardware, resources: Arc<dyn ResourceRegistry>) -> Arc<Self> {
        let ctx = Arc::new(SharedContext::new());
        let endpoints = &settings.endpoints;
        let devices = &settings.devices;

        let thermostat = EndpointController::spawn(
            Arc::new(Thermostat::new(
                hardware.thermostat,
                Arc::clone(&ctx),
                devices.thermostat.clone(),
            )),
            endpoints.thermostat_pool,
            endpoints,
        );
        let mfc = EndpointController::spawn(
            Arc::new(Mfc::new(hardware.mfc, Arc::clone(&ctx), devices.mfc.clone())),
            endpoints.mfc_pool,
            endpoints,
        );
        let camera = EndpointController::spawn(
            Arc::new(Camera::new(
                hardware.camera,
                Arc::clone(&ctx),
                Arc::clone(&resources),
                Arc::clone(&thermostat),
                Arc::clone(&mfc),
            )),
            endpoints.camera_pool,
            endpoints,
        );
        let pump = EndpointController::spawn(
            Arc::new(Pump::new(hardware.pump, Arc::clone(&ctx), devices.pump.clone())),
            endpoints.pump_pool,
            endpoints,
        );
        let analysis = EndpointController::spawn(
            Arc::new(AnalysisEngine::new(
                hardware.analyzer,
                Arc::clone(&ctx),
                Arc::clone(&resources),
                devices.analysis.clone(),
            )),
            endpoints.analysis_pool,
            endpoints,
        );

        let watched: Vec<Arc<dyn ControlHandle>> = vec![
            Arc::clone(&camera) as Arc<dyn ControlHandle>,
            Arc::clone(&thermostat) as Arc<dyn ControlHandle>,
            Arc::clone(&mfc) as Arc<dyn ControlHandle>,
            Arc::clone(&pump) as Arc<dyn ControlHandle>,
        ];
        let supervisor = EndpointController::spawn(
            Arc::new(DeviceSupervisor::new(Arc::clone(&ctx), watched)),
            endpoints.supervisor_pool,
            endpoints,
        );

        let health_cancel = CancellationToken::new();
        let rounds = Arc::clone(&supervisor);
        let health = PeriodicJob::spawn(
            "device_health_rounds",
            Schedule::every(endpoints.health_check_interval()),
            health_cancel.clone(),
            move || {
                rounds.enqueue(SupervisorKind::HealthCheck, Duration::ZERO);
                async {}
            },
        );

        info!("Device registry started");
        Arc::new(Self {
            ctx,
            resources,
            events: EventBus::new(settings.routine.event_capacity),
            camera,
            thermostat,
            mfc,
            pump,
            analysis,
            supervisor,
            health: Mutex::new(Some(health)),
            health_cancel,
        })
    }

    /// Context shared by the endpoints and the engine.
    pub fn context(&self) -> &Arc<SharedContext> {
        &self.ctx
    }

    /// Registry of slot destinations.
    pub fn resources(&self) -> &Arc<dyn ResourceRegistry> {
        &self.resources
    }

    /// Routine notification bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Type-erased handle of one endpoint.
    pub fn endpoint(&self, id: EndpointId) -> Arc<dyn ControlHandle> {
        match id {
            EndpointId::DeviceSupervisor => Arc::clone(&self.supervisor) as Arc<dyn ControlHandle>,
            EndpointId::Camera => Arc::clone(&self.camera) as Arc<dyn ControlHandle>,
            EndpointId::Thermostat => Arc::clone(&self.thermostat) as Arc<dyn ControlHandle>,
            EndpointId::Mfc => Arc::clone(&self.mfc) as Arc<dyn ControlHandle>,
            EndpointId::Pump => Arc::clone(&self.pump) as Arc<dyn ControlHandle>,
            EndpointId::Analysis => Arc::clone(&self.analysis) as Arc<dyn ControlHandle>,
        }
    }

    /// Start gate of an endpoint, if its timed States wait for one.
    pub fn gate(&self, id: EndpointId) -> Option<&StartGate> {
        match id {
            EndpointId::Camera => Some(self.camera.endpoint().capture_gate()),
            EndpointId::Thermostat => Some(self.thermostat.endpoint().polling_gate()),
            EndpointId::Analysis => Some(self.analysis.endpoint().gate()),
            EndpointId::DeviceSupervisor | EndpointId::Mfc | EndpointId::Pump => None,
        }
    }

    /// Every endpoint the engine may drive.
    pub fn routine_endpoints() -> [EndpointId; 5] {
        [
            EndpointId::Camera,
            EndpointId::Thermostat,
            EndpointId::Mfc,
            EndpointId::Pump,
            EndpointId::Analysis,
        ]
    }

    /// Closes all gates and stops every endpoint the engine drives.
    pub fn stop_all(&self) {
        for id in Self::routine_endpoints() {
            if let Some(gate) = self.gate(id) {
                gate.close();
            }
            self.endpoint(id).stop();
        }
    }

    /// Stops the health rounds and shuts every endpoint down, supervisor
    /// first. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.health_cancel.cancel();
        if let Some(job) = self.health.lock().take() {
            job.stop();
        }
        self.supervisor.shutdown().await;
        let endpoints: Vec<_> = Self::routine_endpoints().into_iter().map(|id| self.endpoint(id)).collect();
        join_all(endpoints.iter().map(|endpoint| endpoint.shutdown())).await;
        info!("Device registry shut down");
    }
}
