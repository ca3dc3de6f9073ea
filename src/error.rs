//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while coordinating endpoints and running routines.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the layered configuration.
//! - **`Configuration`**: Semantic errors in the configuration, such as a pool
//!   size outside its allowed range. These are caught during validation.
//! - **`Io`**: Wraps `std::io::Error`, covering directory layout and file access.
//! - **`Instrument`** / **`NotConnected`**: Failures originating from device
//!   hardware or a device that has not been brought up.
//! - **`MissingContext`** / **`ContextType`**: A State expected a value in the
//!   shared context that was absent or had the wrong shape.
//! - **`ResourcesUnresolved`**: The resource registry has no destinations for a
//!   slot. This is the only failure the routine engine promotes to a stop.
//! - **`Processing`**: Failures inside analysis engines.
//!
//! Errors never cross a task boundary. States log their own failures and the
//! dispatch loops keep running, so these values mostly surface in logs.

use crate::context::{Key, Namespace};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by configuration, devices and the routine engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were extracted but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device answered with something unexpected.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A device endpoint has no live connection.
    #[error("Device not connected: {0}")]
    NotConnected(&'static str),

    /// A required context value was never set.
    #[error("Missing context value {key:?} in namespace {namespace:?}")]
    MissingContext {
        /// Namespace that was read.
        namespace: Namespace,
        /// Key that was read.
        key: Key,
    },

    /// A context value could not be read as the requested type.
    #[error("Context value {key:?} has an unexpected type: {source}")]
    ContextType {
        /// Key that was read.
        key: Key,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// A slot's destinations are missing from the resource registry.
    #[error("No resources registered for slot '{0}'")]
    ResourcesUnresolved(String),

    /// Image analysis failed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A routine definition is invalid or could not be (de)serialized.
    #[error("Routine error: {0}")]
    Routine(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
