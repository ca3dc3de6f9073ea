//! Mock Hardware Implementations
//!
//! Simulated devices for tests and the demo binary. All of them use
//! `tokio::time`, so they follow a paused test clock.
//!
//! # Available Mocks
//!
//! - `MockCamera` - 640x480 frames, 33ms readout, injectable grab failures
//! - `MockThermostatLink` - the thermostat board's line protocol with a
//!   temperature that approaches its setpoint on every sensor read
//! - `MockMassFlow` - reads back the last setpoint plus a configurable offset
//! - `MockPump` - fill level moves at the commanded flow in simulated time
//! - `MockAnalyzer` - deterministic results derived from the image file

use crate::devices::analysis::{AnalysisResult, ImageAnalyzer};
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    CameraDeviceSettings, CameraHardware, Frame, MassFlowHardware, PumpHardware, SerialLink,
};
use crate::routine::Algorithm;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

// =============================================================================
// MockCamera
// =============================================================================

/// Simulated camera producing 640x480 frames.
pub struct MockCamera {
    connected: AtomicBool,
    streaming: AtomicBool,
    /// Grabs that return no data before the camera behaves again.
    failing_grabs: AtomicUsize,
    /// Refuse reconnection attempts.
    unplugged: AtomicBool,
    settings: Mutex<CameraDeviceSettings>,
    frames: AtomicUsize,
    connects: AtomicUsize,
    width: u32,
    height: u32,
}

impl MockCamera {
    /// A connected camera.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            streaming: AtomicBool::new(false),
            failing_grabs: AtomicUsize::new(0),
            unplugged: AtomicBool::new(false),
            settings: Mutex::new(CameraDeviceSettings::default()),
            frames: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            width: 640,
            height: 480,
        }
    }

    /// A camera that is not connected yet.
    pub fn disconnected() -> Self {
        let camera = Self::new();
        camera.connected.store(false, Ordering::SeqCst);
        camera
    }

    /// Makes the next `count` grabs return no data.
    pub fn fail_next_grabs(&self, count: usize) {
        self.failing_grabs.store(count, Ordering::SeqCst);
    }

    /// Disconnects the camera and refuses reconnection.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Whether acquisition is running.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Frames delivered so far.
    pub fn frames_grabbed(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Calls to `connect` so far.
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DaqError::NotConnected("camera"))
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraHardware for MockCamera {
    async fn connect(&self) -> AppResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(DaqError::Instrument("no camera found on the bus".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stream_on(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stream_off(&self) -> AppResult<()> {
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn grab(&self) -> AppResult<Option<Frame>> {
        self.ensure_connected()?;
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(DaqError::Instrument("grab on closed stream".into()));
        }
        sleep(Duration::from_millis(33)).await;

        let failing = self.failing_grabs.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_grabs.store(failing - 1, Ordering::SeqCst);
            return Ok(None);
        }

        let n = self.frames.fetch_add(1, Ordering::SeqCst);
        let len = (self.width * self.height) as usize;
        let pixels = (0..len).map(|i| ((i + n) % 251) as u8).collect();
        Ok(Some(Frame {
            width: self.width,
            height: self.height,
            pixels,
        }))
    }

    async fn apply_settings(&self, settings: &CameraDeviceSettings) -> AppResult<CameraDeviceSettings> {
        self.ensure_connected()?;
        let mut current = self.settings.lock();
        *current = *settings;
        // The sensor only supports gain up to 24 dB.
        current.gain = current.gain.min(24.0);
        Ok(*current)
    }
}

// =============================================================================
// MockThermostatLink
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Awaiting {
    Command,
    Setpoint,
    Light,
}

struct Board {
    awaiting: Awaiting,
    temperature: f64,
    setpoint: Option<f64>,
    light: bool,
}

/// Simulated thermostat board speaking the line protocol:
///
/// - `H` answers `Y`
/// - `T` followed by a value line echoes the value
/// - `R` answers three lines: temperature, humidity, light state
/// - `S` followed by `0` or `1` echoes the state
pub struct MockThermostatLink {
    board: Mutex<Board>,
    connected: AtomicBool,
    /// Degrees the temperature moves towards the setpoint per `R`.
    step: f64,
    commands: Mutex<Vec<String>>,
}

impl MockThermostatLink {
    /// A connected board at `temperature` with the light off.
    pub fn new(temperature: f64) -> Self {
        Self {
            board: Mutex::new(Board {
                awaiting: Awaiting::Command,
                temperature,
                setpoint: None,
                light: false,
            }),
            connected: AtomicBool::new(true),
            step: 1.0,
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Fails every later exchange.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Current simulated temperature.
    pub fn temperature(&self) -> f64 {
        self.board.lock().temperature
    }

    /// Overrides the simulated temperature.
    pub fn set_temperature(&self, temperature: f64) {
        self.board.lock().temperature = temperature;
    }

    /// Last setpoint written, if any.
    pub fn setpoint(&self) -> Option<f64> {
        self.board.lock().setpoint
    }

    /// Light state.
    pub fn light(&self) -> bool {
        self.board.lock().light
    }

    /// Every command line received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn respond(&self, command: &str) -> AppResult<Vec<String>> {
        let mut board = self.board.lock();
        let reply = match (board.awaiting, command) {
            (Awaiting::Setpoint, value) => {
                board.awaiting = Awaiting::Command;
                let setpoint: f64 = value
                    .parse()
                    .map_err(|_| DaqError::Instrument(format!("bad setpoint '{value}'")))?;
                board.setpoint = Some(setpoint);
                vec![value.to_string()]
            }
            (Awaiting::Light, value @ ("0" | "1")) => {
                board.awaiting = Awaiting::Command;
                board.light = value == "1";
                vec![value.to_string()]
            }
            (Awaiting::Light, other) => {
                board.awaiting = Awaiting::Command;
                return Err(DaqError::Instrument(format!("bad light state '{other}'")));
            }
            (Awaiting::Command, "H") => vec!["Y".to_string()],
            (Awaiting::Command, "T") => {
                board.awaiting = Awaiting::Setpoint;
                Vec::new()
            }
            (Awaiting::Command, "S") => {
                board.awaiting = Awaiting::Light;
                Vec::new()
            }
            (Awaiting::Command, "R") => {
                if let Some(setpoint) = board.setpoint {
                    let delta = (setpoint - board.temperature).clamp(-self.step, self.step);
                    board.temperature += delta;
                }
                vec![
                    format!("{:.2}", board.temperature),
                    "45.00".to_string(),
                    if board.light { "1" } else { "0" }.to_string(),
                ]
            }
            (Awaiting::Command, other) => {
                return Err(DaqError::Instrument(format!("unknown command '{other}'")));
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl SerialLink for MockThermostatLink {
    async fn connect(&self) -> AppResult<()> {
        sleep(Duration::from_millis(50)).await;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn exchange(&self, command: &str, response_lines: usize) -> AppResult<Vec<String>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DaqError::NotConnected("thermostat"));
        }
        self.commands.lock().push(command.to_string());
        sleep(Duration::from_millis(10)).await;

        let mut reply = self.respond(command)?;
        if reply.len() < response_lines {
            return Err(DaqError::Instrument(format!(
                "expected {response_lines} lines for '{command}', got {}",
                reply.len()
            )));
        }
        reply.truncate(response_lines);
        debug!(command, ?reply, "Thermostat exchange");
        Ok(reply)
    }
}

// =============================================================================
// MockMassFlow
// =============================================================================

/// Simulated mass flow controller.
pub struct MockMassFlow {
    connected: AtomicBool,
    setpoint: Mutex<f64>,
    /// Added to the setpoint when reading back.
    offset: Mutex<f64>,
    writes: Mutex<Vec<f64>>,
}

impl MockMassFlow {
    /// A connected controller with a closed valve.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            setpoint: Mutex::new(0.0),
            offset: Mutex::new(0.0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Shifts the measured flow away from the setpoint.
    pub fn set_offset(&self, offset: f64) {
        *self.offset.lock() = offset;
    }

    /// Makes the controller stop answering.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Last setpoint written.
    pub fn setpoint(&self) -> f64 {
        *self.setpoint.lock()
    }

    /// Every setpoint written, in order.
    pub fn writes(&self) -> Vec<f64> {
        self.writes.lock().clone()
    }
}

impl Default for MockMassFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MassFlowHardware for MockMassFlow {
    async fn connect(&self) -> AppResult<()> {
        sleep(Duration::from_millis(50)).await;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn measured_flow(&self) -> AppResult<Option<f64>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(None);
        }
        sleep(Duration::from_millis(5)).await;
        let setpoint = *self.setpoint.lock();
        if setpoint == 0.0 {
            return Ok(Some(0.0));
        }
        Ok(Some(setpoint + *self.offset.lock()))
    }

    async fn write_setpoint(&self, flow: f64) -> AppResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DaqError::NotConnected("mfc"));
        }
        *self.setpoint.lock() = flow;
        self.writes.lock().push(flow);
        Ok(())
    }
}

// =============================================================================
// MockPump
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    flow: f64,
    started: Instant,
}

impl Motion {
    fn level_at(&self, now: Instant) -> f64 {
        let moved = self.flow * now.saturating_duration_since(self.started).as_secs_f64();
        if self.to >= self.from {
            (self.from + moved).min(self.to)
        } else {
            (self.from - moved).max(self.to)
        }
    }
}

struct PumpDrive {
    level: f64,
    motion: Option<Motion>,
    calibration_done_at: Option<Instant>,
    enabled: bool,
    connected: bool,
    syringe: (f64, f64),
}

impl PumpDrive {
    fn settle(&mut self, now: Instant) -> f64 {
        if let Some(motion) = self.motion {
            self.level = motion.level_at(now);
            if self.level == motion.to {
                self.motion = None;
            }
        }
        self.level
    }
}

/// Simulated syringe pump with a 1000 µL syringe and 50 µL/s maximum flow.
pub struct MockPump {
    drive: Mutex<PumpDrive>,
    max_volume: f64,
    max_flow: f64,
    stops: AtomicUsize,
}

impl MockPump {
    /// An enabled pump holding `level` microlitres.
    pub fn new(level: f64) -> Self {
        Self {
            drive: Mutex::new(PumpDrive {
                level,
                motion: None,
                calibration_done_at: None,
                enabled: true,
                connected: true,
                syringe: (7.97, 50.0),
            }),
            max_volume: 1000.0,
            max_flow: 50.0,
            stops: AtomicUsize::new(0),
        }
    }

    /// Disables the drive.
    pub fn disable(&self) {
        self.drive.lock().enabled = false;
    }

    /// Calls to `stop_pumping` so far.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Configured syringe diameter and length.
    pub fn syringe(&self) -> (f64, f64) {
        self.drive.lock().syringe
    }

    /// Whether a load or dispense is still moving.
    pub fn is_moving(&self) -> bool {
        let mut drive = self.drive.lock();
        drive.settle(Instant::now());
        drive.motion.is_some()
    }

    fn start_motion(&self, target: f64, flow: f64) -> AppResult<()> {
        let mut drive = self.drive.lock();
        if !drive.enabled {
            return Err(DaqError::Instrument("pump drive disabled".into()));
        }
        let now = Instant::now();
        let from = drive.settle(now);
        drive.motion = Some(Motion {
            from,
            to: target.clamp(0.0, self.max_volume),
            flow: flow.clamp(0.0, self.max_flow),
            started: now,
        });
        Ok(())
    }
}

#[async_trait]
impl PumpHardware for MockPump {
    async fn connect(&self) -> AppResult<()> {
        sleep(Duration::from_millis(100)).await;
        self.drive.lock().connected = true;
        Ok(())
    }

    async fn start(&self) -> AppResult<()> {
        let mut drive = self.drive.lock();
        if !drive.connected {
            return Err(DaqError::NotConnected("pump"));
        }
        drive.enabled = true;
        Ok(())
    }

    async fn is_enabled(&self) -> AppResult<bool> {
        Ok(self.drive.lock().enabled)
    }

    async fn fill_level(&self) -> AppResult<f64> {
        Ok(self.drive.lock().settle(Instant::now()))
    }

    async fn max_volume(&self) -> AppResult<f64> {
        Ok(self.max_volume)
    }

    async fn max_flow(&self) -> AppResult<f64> {
        Ok(self.max_flow)
    }

    async fn aspirate(&self, volume: f64, flow: f64) -> AppResult<()> {
        let level = self.fill_level().await?;
        self.start_motion(level + volume, flow)
    }

    async fn dispense(&self, volume: f64, flow: f64) -> AppResult<()> {
        let level = self.fill_level().await?;
        self.start_motion(level - volume, flow)
    }

    async fn calibrate(&self) -> AppResult<()> {
        let mut drive = self.drive.lock();
        drive.motion = None;
        drive.level = 0.0;
        drive.calibration_done_at = Some(Instant::now() + Duration::from_secs(2));
        Ok(())
    }

    async fn is_calibration_finished(&self) -> AppResult<bool> {
        let drive = self.drive.lock();
        Ok(drive
            .calibration_done_at
            .is_some_and(|done| Instant::now() >= done))
    }

    async fn stop_pumping(&self) -> AppResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let mut drive = self.drive.lock();
        drive.settle(Instant::now());
        drive.motion = None;
        Ok(())
    }

    async fn set_syringe(&self, diameter_mm: f64, length_mm: f64) -> AppResult<()> {
        self.drive.lock().syringe = (diameter_mm, length_mm);
        Ok(())
    }
}

// =============================================================================
// MockAnalyzer
// =============================================================================

/// Derives a result from the image's byte length. Takes a few milliseconds
/// of real CPU time per image.
#[derive(Debug, Default)]
pub struct MockAnalyzer {
    processed: AtomicUsize,
}

impl MockAnalyzer {
    /// Analyzer with nothing processed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Images analysed so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

impl ImageAnalyzer for MockAnalyzer {
    fn analyze(&self, algorithm: Algorithm, path: &Path) -> AppResult<AnalysisResult> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(DaqError::Processing(format!("empty image {}", path.display())));
        }
        let checksum: u64 = bytes.iter().map(|b| u64::from(*b)).sum();
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(AnalysisResult {
            path: path.to_path_buf(),
            algorithm,
            objects: (checksum % 97) as usize,
            mean_diameter_px: 10.0 + (checksum % 1000) as f64 / 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_camera_requires_open_stream() {
        let camera = MockCamera::new();
        assert!(camera.grab().await.is_err());
        camera.stream_on().await.unwrap();
        let frame = camera.grab().await.unwrap().unwrap();
        assert_eq!(frame.pixels.len(), 640 * 480);

        camera.fail_next_grabs(1);
        assert!(camera.grab().await.unwrap().is_none());
        assert!(camera.grab().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermostat_protocol() {
        let link = MockThermostatLink::new(20.0);
        assert_eq!(link.exchange("H", 1).await.unwrap(), vec!["Y"]);

        link.exchange("T", 0).await.unwrap();
        assert_eq!(link.exchange("25.5", 1).await.unwrap(), vec!["25.5"]);
        assert_eq!(link.setpoint(), Some(25.5));

        let reading = link.exchange("R", 3).await.unwrap();
        assert_eq!(reading[0], "21.00");

        link.exchange("S", 0).await.unwrap();
        link.exchange("1", 1).await.unwrap();
        assert!(link.light());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_moves_at_commanded_flow() {
        let pump = MockPump::new(0.0);
        pump.aspirate(100.0, 50.0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((pump.fill_level().await.unwrap() - 50.0).abs() < 1e-6);

        pump.stop_pumping().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((pump.fill_level().await.unwrap() - 50.0).abs() < 1e-6);
        assert!(!pump.is_moving());
    }
}
