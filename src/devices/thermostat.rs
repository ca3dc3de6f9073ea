//! Thermostat board: temperature control, sensor readout and the sample light.
//!
//! The board speaks a line protocol over a [`SerialLink`]. A command that
//! takes an argument is two exchanges (`T` then the value, `S` then `0`/`1`),
//! so every transaction holds the bus lock for its whole sequence.

use super::publish_connection;
use crate::config::ThermostatSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{
    Endpoint, EndpointController, EndpointId, PeriodicJob, Schedule, StartGate, State, StateKind,
    StateScope,
};
use crate::error::{AppResult, DaqError};
use crate::hardware::SerialLink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const POLL_GRACE: Duration = Duration::from_secs(2);

/// Controller driving the [`Thermostat`].
pub type ThermostatController = EndpointController<Thermostat>;

/// States of the thermostat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatKind {
    /// Probes the board and reconnects it if needed.
    HealthCheck,
    /// Writes the temperature setpoint from the context.
    SetTemperature,
    /// Publishes sensor readings while live recording is on.
    SensorPolling,
    /// Applies the light state from the context.
    LightSwitch,
}

impl StateKind for ThermostatKind {
    fn label(&self) -> &'static str {
        match self {
            ThermostatKind::HealthCheck => "health_check",
            ThermostatKind::SetTemperature => "set_temperature",
            ThermostatKind::SensorPolling => "sensor_polling",
            ThermostatKind::LightSwitch => "light_switch",
        }
    }
}

/// One sensor readout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Light state reported by the board.
    pub light: bool,
}

impl SensorReading {
    fn parse(lines: &[String]) -> AppResult<Self> {
        let field = |i: usize| {
            lines
                .get(i)
                .map(|l| l.trim())
                .ok_or_else(|| DaqError::Instrument(format!("sensor reply has {} lines", lines.len())))
        };
        let number = |i: usize| -> AppResult<f64> {
            let raw = field(i)?;
            raw.parse()
                .map_err(|_| DaqError::Instrument(format!("bad sensor value '{raw}'")))
        };
        Ok(Self {
            temperature: number(0)?,
            humidity: number(1)?,
            light: field(2)? == "1",
        })
    }
}

/// Thermostat board endpoint: heating, sensors and light.
pub struct Thermostat {
    link: Arc<dyn SerialLink>,
    bus: AsyncMutex<()>,
    ctx: Arc<SharedContext>,
    polling_gate: StartGate,
    settings: ThermostatSettings,
}

impl Thermostat {
    /// Creates the endpoint with sensor polling gated closed.
    pub fn new(link: Arc<dyn SerialLink>, ctx: Arc<SharedContext>, settings: ThermostatSettings) -> Self {
        Self {
            link,
            bus: AsyncMutex::new(()),
            ctx,
            polling_gate: StartGate::new(),
            settings,
        }
    }

    /// Gate released by the engine when sensor polling should begin.
    pub fn polling_gate(&self) -> &StartGate {
        &self.polling_gate
    }

    /// Board tuning, shared with the camera for light timing.
    pub fn settings(&self) -> &ThermostatSettings {
        &self.settings
    }

    /// Runs `steps` back to back while holding the bus. Returns the reply of
    /// the last step.
    async fn transact(&self, steps: &[(&str, usize)]) -> AppResult<Vec<String>> {
        let _bus = self.bus.lock().await;
        let mut reply = Vec::new();
        for (command, lines) in steps {
            reply = self.link.exchange(command, *lines).await?;
        }
        Ok(reply)
    }

    async fn is_healthy(&self) -> bool {
        match self.transact(&[("H", 1)]).await {
            Ok(reply) => reply.first().is_some_and(|l| l.trim() == "Y"),
            Err(e) => {
                debug!(error = %e, "Thermostat health probe failed");
                false
            }
        }
    }

    /// Reads temperature, humidity and light state.
    pub async fn read_sensors(&self) -> AppResult<SensorReading> {
        let reply = self.transact(&[("R", 3)]).await?;
        SensorReading::parse(&reply)
    }

    /// Writes a temperature setpoint. A mismatching echo is logged, not an error.
    pub async fn write_setpoint(&self, target: f64) -> AppResult<()> {
        let value = format!("{target:.2}");
        let echo = self.transact(&[("T", 0), (value.as_str(), 1)]).await?;
        match echo.first().and_then(|l| l.trim().parse::<f64>().ok()) {
            Some(v) if (v - target).abs() < 0.005 => {
                info!(target, "Temperature setpoint written");
            }
            other => warn!(target, echo = ?other, "Thermostat echoed a different setpoint"),
        }
        Ok(())
    }

    /// Switches the light and checks the echo.
    pub async fn write_light(&self, on: bool) -> AppResult<()> {
        let state = if on { "1" } else { "0" };
        let echo = self.transact(&[("S", 0), (state, 1)]).await?;
        if echo.first().map(|l| l.trim()) != Some(state) {
            return Err(DaqError::Instrument(format!(
                "light switch to {state} answered {echo:?}"
            )));
        }
        debug!(on, "Light switched");
        Ok(())
    }

    /// Reads the sensors once and publishes the temperature when live
    /// recording is enabled.
    async fn poll_once(&self) {
        match self.read_sensors().await {
            Ok(reading) => {
                debug!(?reading, "Sensor reading");
                if self.ctx.flag(Namespace::Thermostat, Key::LiveRecording) {
                    self.ctx
                        .set(Namespace::Measurement, Key::LiveTemperature, reading.temperature);
                }
            }
            Err(e) => warn!(error = %e, "Sensor polling failed"),
        }
    }
}

impl Endpoint for Thermostat {
    type Kind = ThermostatKind;
    const ID: EndpointId = EndpointId::Thermostat;
    const HEALTH_CHECK: Option<ThermostatKind> = Some(ThermostatKind::HealthCheck);

    fn build_state(endpoint: &Arc<Self>, kind: ThermostatKind) -> Option<Box<dyn State>> {
        let device = Arc::clone(endpoint);
        Some(match kind {
            ThermostatKind::HealthCheck => Box::new(HealthCheck(device)),
            ThermostatKind::SetTemperature => Box::new(SetTemperature(device)),
            ThermostatKind::SensorPolling => Box::new(SensorPolling(device)),
            ThermostatKind::LightSwitch => Box::new(LightSwitch(device)),
        })
    }
}

struct HealthCheck(Arc<Thermostat>);

#[async_trait]
impl State for HealthCheck {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let device = &self.0;
        if !device.link.is_connected().await {
            if let Err(e) = device.link.connect().await {
                warn!(error = %e, "Thermostat connection failed");
            }
        }
        let mut healthy = device.is_healthy().await;
        if !healthy {
            // One reconnect before giving up.
            if device.link.connect().await.is_ok() {
                healthy = device.is_healthy().await;
            }
        }
        publish_connection(&device.ctx, EndpointId::Thermostat, healthy);
        Ok(())
    }
}

struct SetTemperature(Arc<Thermostat>);

#[async_trait]
impl State for SetTemperature {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let target: f64 = self.0.ctx.require(Namespace::Thermostat, Key::TemperatureSetpoint)?;
        self.0.write_setpoint(target).await
    }
}

/// Reads the sensors on a fixed period until the deadline, starting when the
/// polling gate opens.
struct SensorPolling(Arc<Thermostat>);

#[async_trait]
impl State for SensorPolling {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        if !scope.wait_gate(&self.0.polling_gate).await {
            return Ok(());
        }

        let period = Duration::from_secs(self.0.settings.sensor_poll_secs);
        let device = Arc::clone(&self.0);
        let job = PeriodicJob::spawn(
            "thermostat_sensor_polling",
            Schedule::every(period).until(scope.deadline()),
            scope.child_token(),
            move || {
                let device = Arc::clone(&device);
                async move { device.poll_once().await }
            },
        );
        scope.pause_until_deadline().await;
        // Lets a transaction already on the bus complete.
        job.finish(POLL_GRACE).await;
        Ok(())
    }
}

/// Applies `Measurement/LightMode`. An absent mode leaves the light alone.
struct LightSwitch(Arc<Thermostat>);

#[async_trait]
impl State for LightSwitch {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let Some(on) = self.0.ctx.get::<bool>(Namespace::Measurement, Key::LightMode) else {
            debug!("No light mode set, skipping light switch");
            return Ok(());
        };
        self.0.write_light(on).await
    }
}
