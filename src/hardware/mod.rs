//! Hardware capability traits.
//!
//! Device endpoints talk to hardware only through these traits. The wire
//! protocols and vendor SDKs behind them are out of scope; [`mock`] provides
//! simulated implementations with realistic timing for tests and the demo
//! binary.
//!
//! All methods are async. Implementations wrapping blocking SDK calls are
//! expected to move them onto `spawn_blocking` themselves.

pub mod mock;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One image from the camera stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw pixel data.
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Writes the raw pixel buffer to `path`.
    pub async fn save(&self, path: &Path) -> AppResult<()> {
        tokio::fs::write(path, &self.pixels).await?;
        Ok(())
    }
}

/// Acquisition parameters applied to the camera itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraDeviceSettings {
    /// Let the camera balance white continuously.
    pub auto_white_balance: bool,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Analog gain in dB.
    pub gain: f64,
    /// Colour saturation.
    pub saturation: f64,
}

impl Default for CameraDeviceSettings {
    fn default() -> Self {
        Self {
            auto_white_balance: false,
            exposure_us: 10_000.0,
            gain: 0.0,
            saturation: 64.0,
        }
    }
}

/// Industrial camera driver.
#[async_trait]
pub trait CameraHardware: Send + Sync {
    /// Opens the device.
    async fn connect(&self) -> AppResult<()>;

    /// Whether the device is open and answering.
    async fn is_connected(&self) -> bool;

    /// Starts acquisition.
    async fn stream_on(&self) -> AppResult<()>;

    /// Stops acquisition.
    async fn stream_off(&self) -> AppResult<()>;

    /// Grabs the next frame of the open stream. `None` when the stream
    /// delivered no data.
    async fn grab(&self) -> AppResult<Option<Frame>>;

    /// Writes the settings and returns what the camera reports back.
    async fn apply_settings(&self, settings: &CameraDeviceSettings) -> AppResult<CameraDeviceSettings>;
}

/// Line-oriented serial link to the thermostat board.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Opens the serial port.
    async fn connect(&self) -> AppResult<()>;

    /// Whether the port is open.
    async fn is_connected(&self) -> bool;

    /// Writes one command line and reads `response_lines` lines back.
    async fn exchange(&self, command: &str, response_lines: usize) -> AppResult<Vec<String>>;
}

/// Thermal mass-flow controller.
#[async_trait]
pub trait MassFlowHardware: Send + Sync {
    /// Opens the instrument.
    async fn connect(&self) -> AppResult<()>;

    /// Measured flow, `None` when the instrument does not answer.
    async fn measured_flow(&self) -> AppResult<Option<f64>>;

    /// Writes a flow setpoint. Zero closes the valve.
    async fn write_setpoint(&self, flow: f64) -> AppResult<()>;
}

/// Syringe pump. Volumes in microlitres, flows in microlitres per second.
#[async_trait]
pub trait PumpHardware: Send + Sync {
    /// Opens the bus and looks up the pump.
    async fn connect(&self) -> AppResult<()>;

    /// Clears faults and enables the drive.
    async fn start(&self) -> AppResult<()>;

    /// Whether the drive is enabled.
    async fn is_enabled(&self) -> AppResult<bool>;

    /// Current syringe content.
    async fn fill_level(&self) -> AppResult<f64>;

    /// Syringe capacity.
    async fn max_volume(&self) -> AppResult<f64>;

    /// Highest flow the syringe allows.
    async fn max_flow(&self) -> AppResult<f64>;

    /// Starts drawing `volume` in at `flow`. Returns before the move ends.
    async fn aspirate(&self, volume: f64, flow: f64) -> AppResult<()>;

    /// Starts pushing `volume` out at `flow`. Returns before the move ends.
    async fn dispense(&self, volume: f64, flow: f64) -> AppResult<()>;

    /// Starts the reference move.
    async fn calibrate(&self) -> AppResult<()>;

    /// Whether the reference move completed.
    async fn is_calibration_finished(&self) -> AppResult<bool>;

    /// Halts any move.
    async fn stop_pumping(&self) -> AppResult<()>;

    /// Configures the mounted syringe.
    async fn set_syringe(&self, diameter_mm: f64, length_mm: f64) -> AppResult<()>;
}
