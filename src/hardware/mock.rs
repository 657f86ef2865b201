//! Mock Hardware Implementations
//!
//! Provides simulated beamline devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockDetector` - Simulated area detector (acquire time × frame count exposures)
//! - `MockShutter` - Simulated beam shutter with optional travel time or a stuck state
//! - `MockTemperatureController` - Simulated temperature controller
//!
//! Every mock can share a [`CallLog`] so tests can assert the order in which
//! devices were driven across a whole scan.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{
    AreaDetector, DeviceSet, Reading, Shutter, ShutterState, TemperatureController,
};

/// Ordered record of device calls shared between mocks.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    /// Entries so far, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// =============================================================================
// MockDetector - Simulated Area Detector
// =============================================================================

/// Mock area detector
///
/// Simulates a frame-summing detector with:
/// - Configurable per-frame acquire time and frame count
/// - Stage/unstage tracking (re-staging is allowed)
/// - Optional readout latency
/// - Trigger fault injection for error-path tests
pub struct MockDetector {
    name: String,
    acquire_time: Mutex<f64>,
    frame_count: AtomicU32,
    staged: AtomicBool,
    triggers: AtomicU32,
    fail_trigger: AtomicBool,
    readout: Duration,
    log: CallLog,
}

impl MockDetector {
    /// Detector with a 0.1 s frame and no readout delay.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            acquire_time: Mutex::new(0.1),
            frame_count: AtomicU32::new(1),
            staged: AtomicBool::new(false),
            triggers: AtomicU32::new(0),
            fail_trigger: AtomicBool::new(false),
            readout: Duration::ZERO,
            log: CallLog::new(),
        }
    }

    /// Record calls into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Sleep this long inside every trigger.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Make subsequent triggers fail.
    pub fn fail_triggers(&self, fail: bool) {
        self.fail_trigger.store(fail, Ordering::SeqCst);
    }

    /// Triggers completed so far.
    pub fn trigger_count(&self) -> u32 {
        self.triggers.load(Ordering::SeqCst)
    }

    /// True between stage and unstage.
    pub fn is_staged(&self) -> bool {
        self.staged.load(Ordering::SeqCst)
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new("pe1c")
    }
}

#[async_trait]
impl AreaDetector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_acquire_time(&self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds > 0.0) {
            bail!("{}: invalid acquire time {}", self.name, seconds);
        }
        *self.acquire_time.lock() = seconds;
        self.log.push(format!("{}:acquire_time={}", self.name, seconds));
        Ok(())
    }

    async fn set_frame_count(&self, frames: u32) -> Result<()> {
        if frames == 0 {
            bail!("{}: frame count must be at least 1", self.name);
        }
        self.frame_count.store(frames, Ordering::SeqCst);
        self.log.push(format!("{}:frames={}", self.name, frames));
        Ok(())
    }

    fn acquire_time(&self) -> f64 {
        *self.acquire_time.lock()
    }

    fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::SeqCst)
    }

    async fn stage(&self) -> Result<()> {
        self.staged.store(true, Ordering::SeqCst);
        self.log.push(format!("{}:stage", self.name));
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.staged.store(false, Ordering::SeqCst);
        self.log.push(format!("{}:unstage", self.name));
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if self.fail_trigger.load(Ordering::SeqCst) {
            self.log.push(format!("{}:trigger_failed", self.name));
            bail!("{}: simulated readout failure", self.name);
        }
        let count = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(format!("{}:trigger", self.name));
        debug!(detector = %self.name, frame = count, "triggered");

        if !self.readout.is_zero() {
            sleep(self.readout).await;
        }
        Ok(())
    }

    async fn read(&self) -> Result<Reading> {
        self.log.push(format!("{}:read", self.name));
        let mut reading = Reading::new();
        reading.insert(format!("{}_image_sum", self.name), 1000.0 * self.exposure());
        reading.insert(
            format!("{}_num_frames", self.name),
            f64::from(self.frame_count()),
        );
        Ok(reading)
    }
}

// =============================================================================
// MockShutter - Simulated Beam Shutter
// =============================================================================

/// Mock shutter
///
/// The state changes after `travel`, so callers that poll see the old state
/// for a while. A stuck shutter accepts requests but never moves.
pub struct MockShutter {
    name: String,
    state: Arc<Mutex<ShutterState>>,
    travel: Duration,
    stuck: AtomicBool,
    log: CallLog,
}

impl MockShutter {
    /// A closed shutter that moves instantly.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(ShutterState::Closed)),
            travel: Duration::ZERO,
            stuck: AtomicBool::new(false),
            log: CallLog::new(),
        }
    }

    /// Record calls into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Take this long to reach a requested position.
    pub fn with_travel(mut self, travel: Duration) -> Self {
        self.travel = travel;
        self
    }

    /// Ignore move requests while stuck.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    /// Position right now, without logging.
    pub fn state(&self) -> ShutterState {
        *self.state.lock()
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new("shutter")
    }
}

#[async_trait]
impl Shutter for MockShutter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, state: ShutterState) -> Result<()> {
        self.log.push(format!("{}:{}", self.name, state));
        if self.stuck.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.travel.is_zero() {
            *self.state.lock() = state;
        } else {
            let target = Arc::clone(&self.state);
            let travel = self.travel;
            tokio::spawn(async move {
                sleep(travel).await;
                *target.lock() = state;
            });
        }
        Ok(())
    }

    async fn get(&self) -> Result<ShutterState> {
        Ok(self.state())
    }
}

// =============================================================================
// MockTemperatureController
// =============================================================================

/// Mock temperature controller that reaches every setpoint immediately.
pub struct MockTemperatureController {
    name: String,
    value: Mutex<f64>,
    log: CallLog,
}

impl MockTemperatureController {
    /// Controller sitting at room temperature.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Mutex::new(295.0),
            log: CallLog::new(),
        }
    }

    /// Record calls into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }
}

impl Default for MockTemperatureController {
    fn default() -> Self {
        Self::new("cs700")
    }
}

#[async_trait]
impl TemperatureController for MockTemperatureController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            bail!("{}: invalid setpoint {}", self.name, value);
        }
        *self.value.lock() = value;
        self.log.push(format!("{}:{}", self.name, value));
        Ok(())
    }

    async fn get(&self) -> Result<f64> {
        Ok(*self.value.lock())
    }
}

// =============================================================================
// Bundles
// =============================================================================

/// A full simulated device set plus typed handles for inspection.
pub struct MockDevices {
    /// Detector handle
    pub detector: Arc<MockDetector>,
    /// Shutter handle
    pub shutter: Arc<MockShutter>,
    /// Temperature controller handle
    pub temp_controller: Arc<MockTemperatureController>,
    /// Calls made on any of the devices
    pub log: CallLog,
}

impl MockDevices {
    /// Devices sharing one call log.
    pub fn new() -> Self {
        let log = CallLog::new();
        Self {
            detector: Arc::new(MockDetector::default().with_log(log.clone())),
            shutter: Arc::new(MockShutter::default().with_log(log.clone())),
            temp_controller: Arc::new(MockTemperatureController::default().with_log(log.clone())),
            log,
        }
    }

    /// Trait-object view for a run engine.
    pub fn device_set(&self) -> DeviceSet {
        DeviceSet::new(
            self.detector.clone(),
            self.shutter.clone(),
            self.temp_controller.clone(),
        )
    }
}

impl Default for MockDevices {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
