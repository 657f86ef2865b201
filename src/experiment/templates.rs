//! Scan templates (ct, Tramp, Tlist, tseries) and the plan registry.
//!
//! Every template is a single run. It first configures the detector so that
//! the requested exposure is met with whole frames, then yields one event per
//! exposure. The requested and computed values are both recorded in the run
//! metadata under `sp_*` keys.
//!
//! Parameters are validated when the plan is built, never during execution:
//! an exposure shorter than one detector frame, a zero temperature step or an
//! empty setpoint list is an [`AcqError::Configuration`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{AcqError, AppResult};
use crate::experiment::plans::{Plan, PlanCommand};
use crate::hardware::ShutterState;
use crate::metadata::MetadataMap;

/// Frame counts within this fraction of an integer are treated as exact.
const FRAME_EPSILON: f64 = 1e-9;

/// The closed set of scan-plan kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScanKind {
    /// Single exposure
    #[serde(rename = "ct")]
    Count,
    /// Exposures along a temperature ramp
    #[serde(rename = "Tramp")]
    TemperatureRamp,
    /// Exposures at listed temperatures
    #[serde(rename = "Tlist")]
    TemperatureList,
    /// Exposures repeated over time
    #[serde(rename = "tseries")]
    TimeSeries,
}

impl ScanKind {
    /// Every kind, in registry order.
    pub const ALL: [ScanKind; 4] = [
        ScanKind::Count,
        ScanKind::TemperatureRamp,
        ScanKind::TemperatureList,
        ScanKind::TimeSeries,
    ];

    /// Short name used in metadata and the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Count => "ct",
            ScanKind::TemperatureRamp => "Tramp",
            ScanKind::TemperatureList => "Tlist",
            ScanKind::TimeSeries => "tseries",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ScanKind::Count => "Single exposure",
            ScanKind::TemperatureRamp => "One exposure per point of a linear temperature ramp",
            ScanKind::TemperatureList => "One exposure per temperature in an explicit list",
            ScanKind::TimeSeries => "Repeated exposures separated by a delay",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanKind {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AcqError::Resolution(format!("unknown scan kind '{}'", s)))
    }
}

/// Detector framing that realizes a requested exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameConfig {
    /// Per-frame acquire time in seconds
    pub acquire_time: f64,
    /// Frames summed into one exposure
    pub num_frames: u32,
    /// Exposure asked for, in seconds
    pub requested_exposure: f64,
    /// `acquire_time * num_frames`
    pub computed_exposure: f64,
}

/// `num_frames = max(1, ceil(exposure / acquire_time))`.
///
/// The computed exposure never falls short of the request. Fails when the
/// frame count does not fit the detector's `u32` counter.
pub fn quantize_exposure(exposure: f64, frame_acq_time: f64) -> AppResult<FrameConfig> {
    let ratio = exposure / frame_acq_time;
    let mut frames = (ratio - FRAME_EPSILON).ceil().max(1.0);
    if frames * frame_acq_time < exposure {
        frames += 1.0;
    }
    if !frames.is_finite() || frames > f64::from(u32::MAX) {
        return Err(AcqError::Configuration(format!(
            "exposure {} s needs {} frames of {} s, more than the detector can count",
            exposure, frames, frame_acq_time
        )));
    }
    let num_frames = frames as u32;
    Ok(FrameConfig {
        acquire_time: frame_acq_time,
        num_frames,
        requested_exposure: exposure,
        computed_exposure: f64::from(num_frames) * frame_acq_time,
    })
}

/// Quantize after rejecting exposures no detector frame can realize.
pub fn frame_config(exposure: f64, frame_acq_time: f64) -> AppResult<FrameConfig> {
    if !(frame_acq_time.is_finite() && frame_acq_time > 0.0) {
        return Err(AcqError::Configuration(format!(
            "frame acquire time must be positive, got {}",
            frame_acq_time
        )));
    }
    if !exposure.is_finite() || exposure < frame_acq_time * (1.0 - FRAME_EPSILON) {
        return Err(AcqError::Configuration(format!(
            "exposure {} s is shorter than one detector frame ({} s)",
            exposure, frame_acq_time
        )));
    }
    let frame = quantize_exposure(exposure, frame_acq_time)?;
    info!(
        "requested exposure time = {} s -> computed exposure time = {} s ({} frames x {} s)",
        exposure, frame.computed_exposure, frame.num_frames, frame.acquire_time
    );
    Ok(frame)
}

/// `(number of setpoints, realized step)` for a linear ramp.
pub fn ramp_steps(start: f64, stop: f64, step: f64) -> AppResult<(usize, f64)> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(AcqError::Configuration(format!(
            "temperature ramp bounds must be finite, got {} -> {}",
            start, stop
        )));
    }
    if !(step.is_finite() && step > 0.0) {
        return Err(AcqError::Configuration(format!(
            "temperature step must be positive, got {}",
            step
        )));
    }
    let n = ((stop - start).abs() / step).round() as usize + 1;
    let computed = if n > 1 {
        (stop - start) / (n - 1) as f64
    } else {
        0.0
    };
    info!(
        "requested temperature step size = {} -> computed temperature step size = {}",
        step, computed
    );
    Ok((n, computed))
}

/// Scan parameters as persisted in a scan plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan_name")]
pub enum ScanParams {
    /// Single exposure of `exposure` seconds
    #[serde(rename = "ct")]
    Count {
        /// Seconds
        exposure: f64,
    },
    /// Exposures from `start` to `stop` in steps of `step`
    #[serde(rename = "Tramp")]
    TemperatureRamp {
        /// Seconds per point
        exposure: f64,
        /// First setpoint
        #[serde(rename = "Tstart")]
        start: f64,
        /// Last setpoint
        #[serde(rename = "Tstop")]
        stop: f64,
        /// Requested spacing, adjusted so the ramp ends on `stop`
        #[serde(rename = "Tstep")]
        step: f64,
    },
    /// One exposure at each of `setpoints`
    #[serde(rename = "Tlist")]
    TemperatureList {
        /// Seconds per point
        exposure: f64,
        /// Setpoints, visited in order
        #[serde(rename = "T_list")]
        setpoints: Vec<f64>,
    },
    /// `num` exposures, `delay` seconds apart
    #[serde(rename = "tseries")]
    TimeSeries {
        /// Seconds per exposure
        exposure: f64,
        /// Seconds between exposure starts
        delay: f64,
        /// Number of exposures
        num: u32,
    },
}

impl ScanParams {
    /// Parse parameters given as metadata for the named kind.
    pub fn from_metadata(kind: ScanKind, params: &MetadataMap) -> AppResult<Self> {
        let mut object: serde_json::Map<String, Value> =
            params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        object.insert("plan_name".to_string(), json!(kind.as_str()));
        serde_json::from_value(Value::Object(object)).map_err(|e| {
            AcqError::Configuration(format!("invalid parameters for '{}': {}", kind, e))
        })
    }

    /// Template the parameters belong to.
    pub fn kind(&self) -> ScanKind {
        match self {
            ScanParams::Count { .. } => ScanKind::Count,
            ScanParams::TemperatureRamp { .. } => ScanKind::TemperatureRamp,
            ScanParams::TemperatureList { .. } => ScanKind::TemperatureList,
            ScanParams::TimeSeries { .. } => ScanKind::TimeSeries,
        }
    }

    /// Requested exposure in seconds.
    pub fn exposure(&self) -> f64 {
        match self {
            ScanParams::Count { exposure }
            | ScanParams::TemperatureRamp { exposure, .. }
            | ScanParams::TemperatureList { exposure, .. }
            | ScanParams::TimeSeries { exposure, .. } => *exposure,
        }
    }

    /// Parameter values in positional order, for file naming.
    pub fn args(&self) -> Vec<String> {
        match self {
            ScanParams::Count { exposure } => vec![exposure.to_string()],
            ScanParams::TemperatureRamp {
                exposure,
                start,
                stop,
                step,
            } => vec![
                exposure.to_string(),
                start.to_string(),
                stop.to_string(),
                step.to_string(),
            ],
            ScanParams::TemperatureList {
                exposure,
                setpoints,
            } => std::iter::once(exposure.to_string())
                .chain(setpoints.iter().map(f64::to_string))
                .collect(),
            ScanParams::TimeSeries {
                exposure,
                delay,
                num,
            } => vec![exposure.to_string(), delay.to_string(), num.to_string()],
        }
    }

    /// Parameters without the kind tag.
    pub fn to_metadata(&self) -> MetadataMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter(|(k, _)| k != "plan_name")
                .collect(),
            _ => MetadataMap::new(),
        }
    }

    /// Build the acquisition sequence for these parameters.
    pub fn build(&self, frame_acq_time: f64) -> AppResult<ScanSequence> {
        match self {
            ScanParams::Count { exposure } => count(frame_acq_time, *exposure),
            ScanParams::TemperatureRamp {
                exposure,
                start,
                stop,
                step,
            } => temperature_ramp(frame_acq_time, *exposure, *start, *stop, *step),
            ScanParams::TemperatureList {
                exposure,
                setpoints,
            } => temperature_list(frame_acq_time, *exposure, setpoints.clone()),
            ScanParams::TimeSeries {
                exposure,
                delay,
                num,
            } => time_series(frame_acq_time, *exposure, *delay, *num),
        }
    }
}

fn base_metadata(kind: ScanKind, frame: &FrameConfig) -> MetadataMap {
    let mut md = MetadataMap::new();
    md.insert("sp_type".into(), json!(kind.as_str()));
    md.insert("sp_uid".into(), json!(Uuid::new_v4().to_string()));
    md.insert("sp_time_per_frame".into(), json!(frame.acquire_time));
    md.insert("sp_num_frames".into(), json!(frame.num_frames));
    md.insert("sp_requested_exposure".into(), json!(frame.requested_exposure));
    md.insert("sp_computed_exposure".into(), json!(frame.computed_exposure));
    md.insert("plan_name".into(), json!(kind.as_str()));
    md
}

/// Single exposure.
pub fn count(frame_acq_time: f64, exposure: f64) -> AppResult<ScanSequence> {
    let frame = frame_config(exposure, frame_acq_time)?;
    let metadata = base_metadata(ScanKind::Count, &frame);
    Ok(ScanSequence::new(ScanKind::Count, frame, metadata, vec![None]))
}

/// One exposure at each point of `start..=stop`, stepping by roughly `step`.
pub fn temperature_ramp(
    frame_acq_time: f64,
    exposure: f64,
    start: f64,
    stop: f64,
    step: f64,
) -> AppResult<ScanSequence> {
    let frame = frame_config(exposure, frame_acq_time)?;
    let (n, computed_step) = ramp_steps(start, stop, step)?;
    let setpoints = (0..n)
        .map(|i| Some(start + computed_step * i as f64))
        .collect();

    let mut metadata = base_metadata(ScanKind::TemperatureRamp, &frame);
    metadata.insert("sp_startingT".into(), json!(start));
    metadata.insert("sp_endingT".into(), json!(stop));
    metadata.insert("sp_requested_Tstep".into(), json!(step));
    metadata.insert("sp_computed_Tstep".into(), json!(computed_step));
    metadata.insert("sp_Nsteps".into(), json!(n));

    Ok(ScanSequence::new(ScanKind::TemperatureRamp, frame, metadata, setpoints).shutter_each(true))
}

/// One exposure at each temperature of `setpoints`, in order.
pub fn temperature_list(
    frame_acq_time: f64,
    exposure: f64,
    setpoints: Vec<f64>,
) -> AppResult<ScanSequence> {
    let frame = frame_config(exposure, frame_acq_time)?;
    if setpoints.is_empty() {
        return Err(AcqError::Configuration(
            "temperature list must not be empty".to_string(),
        ));
    }
    if let Some(bad) = setpoints.iter().find(|t| !t.is_finite()) {
        return Err(AcqError::Configuration(format!(
            "temperature list contains invalid setpoint {}",
            bad
        )));
    }

    let mut metadata = base_metadata(ScanKind::TemperatureList, &frame);
    metadata.insert("sp_T_list".into(), json!(setpoints));
    metadata.insert("sp_Nsteps".into(), json!(setpoints.len()));

    let points = setpoints.into_iter().map(Some).collect();
    Ok(ScanSequence::new(ScanKind::TemperatureList, frame, metadata, points).shutter_each(true))
}

/// `num` exposures, `delay` seconds apart start to start.
pub fn time_series(
    frame_acq_time: f64,
    exposure: f64,
    delay: f64,
    num: u32,
) -> AppResult<ScanSequence> {
    let frame = frame_config(exposure, frame_acq_time)?;
    if !(delay.is_finite() && delay >= 0.0) {
        return Err(AcqError::Configuration(format!(
            "delay must be >= 0, got {}",
            delay
        )));
    }
    if num == 0 {
        return Err(AcqError::Configuration(
            "time series needs at least one exposure".to_string(),
        ));
    }

    let real_delay = (delay - frame.computed_exposure).max(0.0);
    let period = frame.computed_exposure.max(real_delay + frame.computed_exposure);
    info!("requested delay = {} s -> computed delay = {} s", delay, real_delay);
    info!(
        "nominal period (neglecting readout overheads) of {} s",
        period
    );

    let mut metadata = base_metadata(ScanKind::TimeSeries, &frame);
    metadata.insert("sp_requested_delay".into(), json!(delay));
    metadata.insert("sp_computed_delay".into(), json!(real_delay));
    metadata.insert("sp_requested_num".into(), json!(num));

    let points = vec![None; num as usize];
    let mut sequence =
        ScanSequence::new(ScanKind::TimeSeries, frame, metadata, points).shutter_each(true);
    if real_delay > 0.0 {
        sequence.delay = Some(Duration::from_secs_f64(real_delay));
    }
    Ok(sequence)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Configure,
    OpenRun,
    CloseShutterFirst,
    PointStart,
    OpenShutter,
    Checkpoint,
    Trigger,
    Wait,
    Read,
    Save,
    CloseShutter,
    Delay,
    CloseRun,
    Done,
}

/// Lazy command generator shared by all templates.
#[derive(Debug, Clone)]
pub struct ScanSequence {
    kind: ScanKind,
    frame: FrameConfig,
    metadata: MetadataMap,
    setpoints: Vec<Option<f64>>,
    shutter_each: bool,
    delay: Option<Duration>,

    point: usize,
    step: Step,
}

impl ScanSequence {
    fn new(
        kind: ScanKind,
        frame: FrameConfig,
        metadata: MetadataMap,
        setpoints: Vec<Option<f64>>,
    ) -> Self {
        Self {
            kind,
            frame,
            metadata,
            setpoints,
            shutter_each: false,
            delay: None,
            point: 0,
            step: Step::Configure,
        }
    }

    fn shutter_each(mut self, enabled: bool) -> Self {
        self.shutter_each = enabled;
        self
    }

    /// Merge extra run metadata; these keys win over the template's own.
    pub fn with_metadata(mut self, extra: MetadataMap) -> Self {
        self.metadata.extend(extra);
        self
    }

    /// Template the plan was built from.
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Detector framing the plan was built with.
    pub fn frame(&self) -> &FrameConfig {
        &self.frame
    }

    /// Metadata put on the plan's start document.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Number of exposures (events) this run will record.
    pub fn num_points(&self) -> usize {
        self.setpoints.len()
    }

    fn group(&self) -> String {
        format!("exposure-{}", self.point)
    }
}

impl Plan for ScanSequence {
    fn plan_type(&self) -> &str {
        self.kind.as_str()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        loop {
            let (cmd, next) = match self.step {
                Step::Configure => (
                    Some(PlanCommand::Configure {
                        acquire_time: self.frame.acquire_time,
                        frame_count: self.frame.num_frames,
                    }),
                    Step::OpenRun,
                ),
                Step::OpenRun => (
                    Some(PlanCommand::open_run(self.metadata.clone())),
                    if self.shutter_each {
                        Step::CloseShutterFirst
                    } else {
                        Step::PointStart
                    },
                ),
                Step::CloseShutterFirst => (
                    Some(PlanCommand::SetShutter(ShutterState::Closed)),
                    Step::PointStart,
                ),
                Step::PointStart => match self.setpoints.get(self.point) {
                    None => (None, Step::CloseRun),
                    Some(setpoint) => (
                        setpoint.map(PlanCommand::SetTemperature),
                        Step::OpenShutter,
                    ),
                },
                Step::OpenShutter => (
                    self.shutter_each
                        .then_some(PlanCommand::SetShutter(ShutterState::Open)),
                    Step::Checkpoint,
                ),
                Step::Checkpoint => (Some(PlanCommand::Checkpoint), Step::Trigger),
                Step::Trigger => (Some(PlanCommand::trigger(&self.group())), Step::Wait),
                Step::Wait => (Some(PlanCommand::wait(&self.group())), Step::Read),
                Step::Read => (Some(PlanCommand::Read), Step::Save),
                Step::Save => (Some(PlanCommand::Save), Step::CloseShutter),
                Step::CloseShutter => (
                    self.shutter_each
                        .then_some(PlanCommand::SetShutter(ShutterState::Closed)),
                    Step::Delay,
                ),
                Step::Delay => {
                    self.point += 1;
                    let more = self.point < self.setpoints.len();
                    (
                        self.delay.filter(|_| more).map(PlanCommand::Sleep),
                        Step::PointStart,
                    )
                }
                Step::CloseRun => (Some(PlanCommand::CloseRun), Step::Done),
                Step::Done => return None,
            };
            self.step = next;
            if cmd.is_some() {
                return cmd;
            }
        }
    }
}

/// Builds a plan from named parameters.
pub trait PlanBuilder: Send + Sync {
    /// Build a plan from parameters, quantizing exposures to `frame_acq_time`.
    fn build(&self, params: &MetadataMap, frame_acq_time: f64) -> AppResult<Box<dyn Plan>>;

    /// Get human-readable description of the plan type
    fn description(&self) -> String;
}

/// Builder for one of the built-in templates
#[derive(Debug, Clone, Copy)]
pub struct TemplateBuilder {
    kind: ScanKind,
}

impl TemplateBuilder {
    /// Builder for the template of `kind`.
    pub fn new(kind: ScanKind) -> Self {
        Self { kind }
    }
}

impl PlanBuilder for TemplateBuilder {
    fn build(&self, params: &MetadataMap, frame_acq_time: f64) -> AppResult<Box<dyn Plan>> {
        let params = ScanParams::from_metadata(self.kind, params)?;
        Ok(Box::new(params.build(frame_acq_time)?))
    }

    fn description(&self) -> String {
        self.kind.description().to_string()
    }
}

/// Maps plan names to builders
pub struct PlanRegistry {
    builders: BTreeMap<String, Box<dyn PlanBuilder>>,
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::with_templates()
    }
}

impl PlanRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// A registry holding `ct`, `Tramp`, `Tlist` and `tseries`
    pub fn with_templates() -> Self {
        let mut registry = Self::new();
        for kind in ScanKind::ALL {
            registry
                .builders
                .insert(kind.as_str().to_string(), Box::new(TemplateBuilder::new(kind)));
        }
        registry
    }

    /// Register a builder. An existing name is only replaced with `overwrite`.
    pub fn register<B>(&mut self, name: &str, builder: B, overwrite: bool) -> AppResult<()>
    where
        B: PlanBuilder + 'static,
    {
        if self.builders.contains_key(name) && !overwrite {
            return Err(AcqError::Configuration(format!(
                "a plan is already registered as '{}'; pass overwrite to replace it",
                name
            )));
        }
        self.builders.insert(name.to_string(), Box::new(builder));
        Ok(())
    }

    /// Remove a builder. Returns false if none was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.builders.remove(name).is_some()
    }

    /// True if `name` is registered.
    pub fn has_type(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// `(name, description)` pairs, sorted by name
    pub fn list_types(&self) -> Vec<(String, String)> {
        self.builders
            .iter()
            .map(|(k, v)| (k.clone(), v.description()))
            .collect()
    }

    /// Build the plan registered as `name`.
    pub fn create_plan(
        &self,
        name: &str,
        params: &MetadataMap,
        frame_acq_time: f64,
    ) -> AppResult<Box<dyn Plan>> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| AcqError::Resolution(format!("no plan registered as '{}'", name)))?;
        builder.build(params, frame_acq_time)
    }
}
