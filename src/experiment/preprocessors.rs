//! Plan transforms applied to every invocation.
//!
//! Each transform wraps a `Box<dyn Plan>` and is itself a plan, so they stack:
//!
//! ```text
//! MetadataInjector(DarkInterleaver(ShutterBracket(scan)))
//! ```
//!
//! They work one command at a time, with no look-ahead, and never reorder
//! what the wrapped plan yields.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::calibration::latest_calibration;
use crate::config::{BeamlineConfig, Settings};
use crate::experiment::dark::{DarkFrameCache, DarkPolicy};
use crate::experiment::plans::{Plan, PlanCommand, DARK_FRAME_KEY};
use crate::hardware::{AreaDetector, ShutterState};
use crate::metadata::MetadataMap;

/// Trigger group used by the dark sub-plan.
pub const DARK_GROUP: &str = "dark";

/// Metadata key linking a light run to the dark run it should be corrected with.
pub const DARK_FIELD_UID_KEY: &str = "dark-field-uid";

// =============================================================================
// ShutterBracket
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum BracketStage {
    Open,
    Inner,
    Close,
    Done,
}

/// Open the shutter before the wrapped plan and close it afterwards.
pub struct ShutterBracket {
    inner: Box<dyn Plan>,
    stage: BracketStage,
}

impl ShutterBracket {
    /// Bracket `inner` with an open and a close.
    pub fn new(inner: Box<dyn Plan>) -> Self {
        Self {
            inner,
            stage: BracketStage::Open,
        }
    }
}

impl Plan for ShutterBracket {
    fn plan_type(&self) -> &str {
        self.inner.plan_type()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        match self.stage {
            BracketStage::Open => {
                self.stage = BracketStage::Inner;
                Some(PlanCommand::SetShutter(ShutterState::Open))
            }
            BracketStage::Inner => match self.inner.next_command() {
                Some(cmd) => Some(cmd),
                None => {
                    self.stage = BracketStage::Close;
                    self.next_command()
                }
            },
            BracketStage::Close => {
                self.stage = BracketStage::Done;
                Some(PlanCommand::SetShutter(ShutterState::Closed))
            }
            BracketStage::Done => None,
        }
    }
}

// =============================================================================
// DarkInterleaver
// =============================================================================

/// Commands acquiring one dark frame with the current detector configuration.
pub fn dark_subplan(settle: Duration) -> Vec<PlanCommand> {
    let settle_cmd = (!settle.is_zero()).then_some(PlanCommand::Sleep(settle));
    let mut md = MetadataMap::new();
    md.insert(DARK_FRAME_KEY.to_string(), json!(true));

    let mut commands = vec![PlanCommand::Unstage, PlanCommand::SetShutter(ShutterState::Closed)];
    commands.extend(settle_cmd.clone());
    commands.extend([
        PlanCommand::open_run(md),
        PlanCommand::trigger(DARK_GROUP),
        PlanCommand::wait(DARK_GROUP),
        PlanCommand::Read,
        PlanCommand::Save,
        PlanCommand::CloseRun,
        PlanCommand::SetShutter(ShutterState::Open),
    ]);
    commands.extend(settle_cmd);
    commands.push(PlanCommand::Stage);
    commands
}

/// Splices a dark-frame run in front of a light run when no cached dark
/// matches the detector's current configuration.
///
/// `NEED_DARK` starts armed. Under [`DarkPolicy::OncePerInvocation`] it is
/// cleared by the first insertion; under [`DarkPolicy::RevalidateEachRun`]
/// every light run is checked.
pub struct DarkInterleaver {
    inner: Box<dyn Plan>,
    detector: Arc<dyn AreaDetector>,
    cache: DarkFrameCache,
    window_minutes: f64,
    policy: DarkPolicy,
    settle: Duration,
    need_dark: bool,
    pending: VecDeque<PlanCommand>,
}

impl DarkInterleaver {
    /// Interleave darks into `inner`, reusing records from `cache`.
    pub fn new(
        inner: Box<dyn Plan>,
        detector: Arc<dyn AreaDetector>,
        cache: DarkFrameCache,
        settings: &Settings,
    ) -> Self {
        let acq = &settings.acquisition;
        Self {
            inner,
            detector,
            cache,
            window_minutes: acq.dark_window_minutes,
            policy: acq.dark_policy,
            settle: acq.shutter_settle,
            need_dark: true,
            pending: VecDeque::new(),
        }
    }

    /// Decide whether a dark run goes in front of the light run about to open.
    fn dark_needed(&mut self) -> bool {
        if self.policy == DarkPolicy::RevalidateEachRun {
            self.need_dark = true;
        }
        if !self.need_dark {
            return false;
        }

        let exposure = self.detector.exposure();
        let acquire_time = self.detector.acquire_time();
        match self.cache.validate(exposure, acquire_time, self.window_minutes) {
            Some(uid) => {
                info!(uid = %uid, exposure, "reusing dark frame");
                false
            }
            None => {
                info!(
                    exposure,
                    acquire_time, "no valid dark frame, inserting a dark-frame run"
                );
                self.need_dark = false;
                true
            }
        }
    }
}

impl Plan for DarkInterleaver {
    fn plan_type(&self) -> &str {
        self.inner.plan_type()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if let Some(cmd) = self.pending.pop_front() {
            return Some(cmd);
        }
        let cmd = self.inner.next_command()?;
        if cmd.is_light_open_run() && self.dark_needed() {
            self.pending.extend(dark_subplan(self.settle));
            self.pending.push_back(cmd);
            return self.pending.pop_front();
        }
        Some(cmd)
    }
}

// =============================================================================
// MetadataInjector
// =============================================================================

/// Attaches per-run metadata on every `OpenRun`:
///
/// - beamline keys (`xpdacq_md_version`, `analysis_stage`, `owner`,
///   `beamline_id`, `group`)
/// - `calibration_md`, read from disk at that moment
/// - `dark-field-uid` on light runs, when auto-dark is on
pub struct MetadataInjector {
    inner: Box<dyn Plan>,
    detector: Arc<dyn AreaDetector>,
    cache: DarkFrameCache,
    window_minutes: f64,
    auto_dark: bool,
    calibration: Option<(PathBuf, String)>,
    beamline: BeamlineConfig,
}

impl MetadataInjector {
    /// Inject metadata into every start document `inner` opens. `auto_dark`
    /// controls whether `dark-field-uid` is added.
    pub fn new(
        inner: Box<dyn Plan>,
        detector: Arc<dyn AreaDetector>,
        cache: DarkFrameCache,
        settings: &Settings,
        auto_dark: bool,
    ) -> Self {
        let acq = &settings.acquisition;
        let calibration = acq
            .auto_load_calib
            .then(|| (settings.calibration_dir(), acq.calibration_extension.clone()));
        Self {
            inner,
            detector,
            cache,
            window_minutes: acq.dark_window_minutes,
            auto_dark,
            calibration,
            beamline: settings.beamline.clone(),
        }
    }

    fn calibration_md(&self) -> Option<Value> {
        let (dir, extension) = self.calibration.as_ref()?;
        match latest_calibration(dir, extension) {
            Ok(Some(info)) => {
                info!(file = %info.file_name, "attaching calibration parameters");
                Some(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            Ok(None) => {
                info!(dir = %dir.display(), "no calibration file found");
                Some(Value::Null)
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to load calibration file");
                Some(Value::Null)
            }
        }
    }

    fn inject(&self, metadata: &mut MetadataMap, dark: bool) {
        metadata.insert("xpdacq_md_version".into(), json!(self.beamline.md_version));
        metadata.insert("analysis_stage".into(), json!("raw"));
        metadata.insert("owner".into(), json!(self.beamline.owner));
        metadata.insert("beamline_id".into(), json!(self.beamline.beamline_id));
        metadata.insert("group".into(), json!(self.beamline.group));

        if let Some(calibration) = self.calibration_md() {
            metadata.insert("calibration_md".into(), calibration);
        }

        if self.auto_dark && !dark {
            let uid = self.cache.validate(
                self.detector.exposure(),
                self.detector.acquire_time(),
                self.window_minutes,
            );
            debug!(dark_uid = ?uid, "attaching dark-field uid");
            metadata.insert(
                DARK_FIELD_UID_KEY.into(),
                uid.map(Value::String).unwrap_or(Value::Null),
            );
        }
    }
}

impl Plan for MetadataInjector {
    fn plan_type(&self) -> &str {
        self.inner.plan_type()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        let mut cmd = self.inner.next_command()?;
        let dark = cmd.is_dark_open_run();
        if let PlanCommand::OpenRun { metadata } = &mut cmd {
            self.inject(metadata, dark);
        }
        Some(cmd)
    }
}
