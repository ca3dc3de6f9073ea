//! Core library for the daq_routine application.
//!
//! This library contains the endpoint framework (task queues, execution
//! pools, cancellable States), the concrete device endpoints, and the
//! routine engine that sequences them into multi-phase experiments. It is
//! used by the `daq_routine` binary and by the integration tests.

pub mod config;
pub mod context;
pub mod devices;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod hardware;
pub mod progress;
pub mod resources;
pub mod routine;

pub use error::{AppResult, DaqError};
