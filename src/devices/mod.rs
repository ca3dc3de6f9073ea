//! Device endpoints.
//!
//! Each submodule defines one [`Endpoint`](crate::endpoint::Endpoint): the
//! device handle, its closed set of State kinds and the States themselves.
//! Hardware is reached only through the traits in [`crate::hardware`].
//!
//! Every device publishes its connection flag under
//! `(Namespace::Devices, Key::Connected(id))` from its health check; the
//! [`supervisor`] reads those flags to decide which devices need probing.

pub mod analysis;
pub mod camera;
pub mod mfc;
pub mod pump;
pub mod supervisor;
pub mod thermostat;

pub use analysis::{AnalysisController, AnalysisEngine, AnalysisKind, AnalysisResult, ImageAnalyzer};
pub use camera::{Camera, CameraController, CameraKind};
pub use mfc::{Mfc, MfcController, MfcKind};
pub use pump::{Pump, PumpController, PumpKind};
pub use supervisor::{DeviceSupervisor, SupervisorController, SupervisorKind};
pub use thermostat::{Thermostat, ThermostatController, ThermostatKind};

use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::EndpointId;
use tracing::{info, warn};

/// Records the outcome of a health check.
pub(crate) fn publish_connection(ctx: &SharedContext, id: EndpointId, connected: bool) {
    let was: bool = ctx.flag(Namespace::Devices, Key::Connected(id));
    ctx.set(Namespace::Devices, Key::Connected(id), connected);
    match (was, connected) {
        (false, true) => info!(device = id.name(), "Device healthy and connected"),
        (_, false) => warn!(device = id.name(), "Device not connected"),
        (true, true) => {}
    }
}
