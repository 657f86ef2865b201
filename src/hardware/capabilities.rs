//! Capability traits for the devices an acquisition touches.
//!
//! The run engine only relies on these contracts. Real drivers and the
//! simulators in [`crate::hardware::mock`] implement them alike.
//!
//! Settings readback (`acquire_time`, `frame_count`) is synchronous: drivers
//! serve it from the configuration they last applied, which lets plan
//! transforms consult the detector without awaiting hardware.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Values produced by one detector read, keyed by field name.
pub type Reading = HashMap<String, f64>;

/// Position of the beam shutter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterState {
    /// Beam on the sample
    Open,
    /// Beam blocked
    Closed,
}

impl fmt::Display for ShutterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Area detector whose exposure is built from repeated fixed-length frames.
#[async_trait]
pub trait AreaDetector: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Per-frame integration time in seconds.
    async fn set_acquire_time(&self, seconds: f64) -> Result<()>;

    /// Number of frames summed into one exposure.
    async fn set_frame_count(&self, frames: u32) -> Result<()>;

    /// Per-frame integration time in seconds.
    fn acquire_time(&self) -> f64;

    /// Frames summed into one exposure.
    fn frame_count(&self) -> u32;

    /// Prepare for a sequence of triggers.
    async fn stage(&self) -> Result<()>;

    /// Release the detector after a run.
    async fn unstage(&self) -> Result<()>;

    /// Acquire one exposure. The returned future completes when readout is done.
    async fn trigger(&self) -> Result<()>;

    /// Latest reading, field name to value.
    async fn read(&self) -> Result<Reading>;

    /// Total exposure the current configuration produces.
    fn exposure(&self) -> f64 {
        self.acquire_time() * f64::from(self.frame_count())
    }
}

/// Beam shutter. `set` issues the request; callers poll `get` for arrival.
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Request a move. Arrival is observed through [`Shutter::get`].
    async fn set(&self, state: ShutterState) -> Result<()>;

    /// Current position.
    async fn get(&self) -> Result<ShutterState>;
}

/// Sample-environment temperature controller.
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Drive to `value`. Completes once the setpoint is reached.
    async fn set(&self, value: f64) -> Result<()>;

    /// Current temperature.
    async fn get(&self) -> Result<f64>;
}

/// The devices bound to one run engine.
#[derive(Clone)]
pub struct DeviceSet {
    /// Area detector
    pub detector: Arc<dyn AreaDetector>,
    /// Beam shutter
    pub shutter: Arc<dyn Shutter>,
    /// Sample temperature controller
    pub temp_controller: Arc<dyn TemperatureController>,
}

impl DeviceSet {
    /// Bundle the three devices.
    pub fn new(
        detector: Arc<dyn AreaDetector>,
        shutter: Arc<dyn Shutter>,
        temp_controller: Arc<dyn TemperatureController>,
    ) -> Self {
        Self {
            detector,
            shutter,
            temp_controller,
        }
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSet")
            .field("detector", &self.detector.name())
            .field("shutter", &self.shutter.name())
            .field("temp_controller", &self.temp_controller.name())
            .finish()
    }
}
