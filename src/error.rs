//! Custom error types for the application.
//!
//! This module defines the primary error type, `AcqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure an acquisition can hit, from bad user input to
//! devices that never report completion.
//!
//! ## Error Hierarchy
//!
//! Validation errors fail fast, before any device is touched:
//!
//! - **`Configuration`**: a plan or setting that can never run correctly, e.g. an
//!   exposure shorter than one detector frame. Raised when the plan is built.
//! - **`Resolution`**: a sample or scan-plan reference (index or name) that does not
//!   resolve against the bound beamtime.
//! - **`IllegalMetadata`**: caller-supplied metadata keys that collide with keys the
//!   sample already carries.
//!
//! Device errors interrupt a run that is already executing:
//!
//! - **`DeviceTimeout`**: a device never reached the requested state in time.
//! - **`DeviceFault`**: a device reported an error.
//! - **`Interrupted`**: the run was aborted at a checkpoint.
//!
//! The remaining variants wrap persistence and configuration-loading failures. By
//! using `#[from]`, `AcqError` can be created from the underlying error types with `?`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

/// Errors raised by the acquisition stack.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Invalid settings or plan parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A sample or plan reference that does not resolve
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Caller metadata that would shadow sample fields
    #[error("Illegal metadata: keys {keys:?} are always provided by the sample")]
    IllegalMetadata {
        /// The offending keys
        keys: Vec<String>,
    },

    /// A device operation that did not finish in time
    #[error("Device '{device}' timed out after {waited:?}")]
    DeviceTimeout {
        /// Device name
        device: String,
        /// Time waited before giving up
        waited: Duration,
    },

    /// A device reported an error
    #[error("Device '{device}' fault: {reason}")]
    DeviceFault {
        /// Device name
        device: String,
        /// Error reported by the device
        reason: String,
    },

    /// Aborted run, when the caller asked for it to be raised
    #[error("Run interrupted: {0}")]
    Interrupted(String),

    /// Run log missing or incomplete
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Settings could not be loaded
    #[error("Settings error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(Box::new(err))
    }
}

impl AcqError {
    /// True for errors raised before any device interaction.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AcqError::Configuration(_) | AcqError::Resolution(_) | AcqError::IllegalMetadata { .. }
        )
    }

    /// Wraps a device-level error, keeping typed crate errors intact.
    pub fn from_device(device: &str, err: anyhow::Error) -> Self {
        match err.downcast::<AcqError>() {
            Ok(acq) => acq,
            Err(other) => AcqError::DeviceFault {
                device: device.to_string(),
                reason: format!("{:#}", other),
            },
        }
    }
}
