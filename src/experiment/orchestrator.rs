//! Acquisition entry point bound to a beamtime.
//!
//! [`CustomizedRunEngine::invoke`] resolves a sample and a plan, checks the
//! caller's metadata, wraps the scan in the standard transforms and runs it:
//!
//! ```text
//! MetadataInjector( DarkInterleaver( ShutterBracket( scan ) ) )
//! ```
//!
//! The shutter bracket is skipped when shutter control is disabled and the
//! dark interleaver when auto-dark is off. Resolution and metadata errors are
//! returned before anything touches a device or the dark cache.

use std::fmt;
use tracing::{debug, info};

use crate::beamtime::{Beamtime, Sample, ScanPlan};
use crate::config::Settings;
use crate::error::{AcqError, AppResult};
use crate::experiment::dark::DarkFrameCache;
use crate::experiment::document::Document;
use crate::experiment::plans::Plan;
use crate::experiment::preprocessors::{DarkInterleaver, MetadataInjector, ShutterBracket};
use crate::experiment::run_engine::{DocumentCallback, EngineControl, ExecuteOptions, RunEngine};
use crate::experiment::templates::PlanRegistry;
use crate::hardware::DeviceSet;
use crate::metadata::MetadataMap;

/// The sample a run is taken on.
#[derive(Debug, Clone)]
pub enum SampleRef {
    /// Index into the beamtime's visible samples
    Index(usize),
    /// Literal metadata
    Inline(MetadataMap),
    /// An already-resolved sample
    Entity(Sample),
}

impl From<usize> for SampleRef {
    fn from(index: usize) -> Self {
        SampleRef::Index(index)
    }
}

impl From<MetadataMap> for SampleRef {
    fn from(md: MetadataMap) -> Self {
        SampleRef::Inline(md)
    }
}

impl From<Sample> for SampleRef {
    fn from(sample: Sample) -> Self {
        SampleRef::Entity(sample)
    }
}

/// The plan to execute.
pub enum PlanRef {
    /// A registry entry built from parameters
    Named {
        /// Registered plan name
        name: String,
        /// Builder parameters
        params: MetadataMap,
    },
    /// Index into the beamtime's visible scan plans
    Index(usize),
    /// A scan plan resolved by the caller
    ScanPlan(ScanPlan),
    /// An already-built plan
    Stream(Box<dyn Plan>),
}

impl PlanRef {
    /// Registry entry `name` built from `params`.
    pub fn named(name: &str, params: MetadataMap) -> Self {
        PlanRef::Named {
            name: name.to_string(),
            params,
        }
    }
}

impl fmt::Debug for PlanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanRef::Named { name, params } => f
                .debug_struct("Named")
                .field("name", name)
                .field("params", params)
                .finish(),
            PlanRef::Index(index) => f.debug_tuple("Index").field(index).finish(),
            PlanRef::ScanPlan(sp) => f.debug_tuple("ScanPlan").field(&sp.to_string()).finish(),
            PlanRef::Stream(plan) => f.debug_tuple("Stream").field(&plan.plan_type()).finish(),
        }
    }
}

impl From<usize> for PlanRef {
    fn from(index: usize) -> Self {
        PlanRef::Index(index)
    }
}

impl From<ScanPlan> for PlanRef {
    fn from(sp: ScanPlan) -> Self {
        PlanRef::ScanPlan(sp)
    }
}

impl From<Box<dyn Plan>> for PlanRef {
    fn from(plan: Box<dyn Plan>) -> Self {
        PlanRef::Stream(plan)
    }
}

/// Per-call options of [`CustomizedRunEngine::invoke`].
pub struct InvokeOptions {
    /// Subscribers for this call only
    pub subs: Vec<DocumentCallback>,
    /// Insert and reuse dark frames
    pub auto_dark: bool,
    /// Log each run and check the log was fully written
    pub verify_write: bool,
    /// Return [`AcqError::Interrupted`] when the plan is aborted
    pub raise_if_interrupted: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            subs: Vec::new(),
            auto_dark: true,
            verify_write: false,
            raise_if_interrupted: false,
        }
    }
}

impl InvokeOptions {
    /// Add a per-call subscriber.
    pub fn with_sub(mut self, sub: DocumentCallback) -> Self {
        self.subs.push(sub);
        self
    }

    /// Override the auto-dark setting for this call.
    pub fn auto_dark(mut self, enabled: bool) -> Self {
        self.auto_dark = enabled;
        self
    }
}

/// Run engine bound to one beamtime, with its own dark cache and plan registry.
pub struct CustomizedRunEngine {
    beamtime: Beamtime,
    settings: Settings,
    registry: PlanRegistry,
    engine: RunEngine,
}

impl CustomizedRunEngine {
    /// The dark cache is mirrored and capped as the settings ask.
    pub fn new(beamtime: Beamtime, devices: DeviceSet, settings: Settings) -> AppResult<Self> {
        let acq = &settings.acquisition;
        let cache = if acq.dark_cache_mirror {
            DarkFrameCache::from_mirror(settings.dark_mirror_path())?
        } else {
            DarkFrameCache::new()
        }
        .with_limit(acq.dark_cache_limit);

        Ok(Self::with_cache(beamtime, devices, settings, cache))
    }

    /// Build around an existing dark cache, e.g. one shared between engines.
    pub fn with_cache(
        beamtime: Beamtime,
        devices: DeviceSet,
        settings: Settings,
        cache: DarkFrameCache,
    ) -> Self {
        let engine = RunEngine::new(devices, cache, &settings);
        Self {
            beamtime,
            settings,
            registry: PlanRegistry::with_templates(),
            engine,
        }
    }

    /// The bound beamtime.
    pub fn beamtime(&self) -> &Beamtime {
        &self.beamtime
    }

    /// Mutable access for registering samples and scan plans.
    pub fn beamtime_mut(&mut self) -> &mut Beamtime {
        &mut self.beamtime
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Plans resolvable by name.
    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    /// Mutable access for registering custom plan builders.
    pub fn registry_mut(&mut self) -> &mut PlanRegistry {
        &mut self.registry
    }

    /// Dark frames recorded so far.
    pub fn dark_cache(&self) -> &DarkFrameCache {
        self.engine.cache()
    }

    /// Pause, resume and abort handle.
    pub fn control(&self) -> EngineControl {
        self.engine.control()
    }

    /// Receive every document emitted from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Document> {
        self.engine.subscribe()
    }

    /// Options with `auto_dark` taken from the settings.
    pub fn default_options(&self) -> InvokeOptions {
        InvokeOptions::default().auto_dark(self.settings.acquisition.auto_dark)
    }

    /// Flattened copy of the sample's metadata.
    fn resolve_sample(&self, sample: SampleRef) -> AppResult<MetadataMap> {
        match sample {
            SampleRef::Index(index) => Ok(self.beamtime.sample(index)?.md().flatten()),
            SampleRef::Inline(md) => Ok(md),
            SampleRef::Entity(sample) => Ok(sample.md().flatten()),
        }
    }

    fn resolve_plan(&self, plan: PlanRef) -> AppResult<Box<dyn Plan>> {
        let frame_acq_time = self.settings.acquisition.frame_acq_time;
        match plan {
            PlanRef::Named { name, params } => {
                self.registry.create_plan(&name, &params, frame_acq_time)
            }
            PlanRef::Index(index) => Ok(Box::new(
                self.beamtime.scanplan(index)?.factory(frame_acq_time)?,
            )),
            PlanRef::ScanPlan(sp) => Ok(Box::new(sp.factory(frame_acq_time)?)),
            PlanRef::Stream(plan) => Ok(plan),
        }
    }

    /// Wrap `scan` in the standard transforms.
    fn wrap(&self, scan: Box<dyn Plan>, auto_dark: bool) -> Box<dyn Plan> {
        let detector = &self.engine.devices().detector;
        let cache = self.engine.cache();

        let mut plan = scan;
        if self.settings.acquisition.shutter_control {
            plan = Box::new(ShutterBracket::new(plan));
        }
        if auto_dark {
            plan = Box::new(DarkInterleaver::new(
                plan,
                detector.clone(),
                cache.clone(),
                &self.settings,
            ));
        }
        Box::new(MetadataInjector::new(
            plan,
            detector.clone(),
            cache.clone(),
            &self.settings,
            auto_dark,
        ))
    }

    /// Run `plan` on `sample`. Returns the uid of every run taken, dark runs included.
    ///
    /// `metadata` keys must not collide with keys the sample already has.
    pub async fn invoke(
        &self,
        sample: impl Into<SampleRef>,
        plan: impl Into<PlanRef>,
        options: InvokeOptions,
        metadata: MetadataMap,
    ) -> AppResult<Vec<String>> {
        let sample_md = self.resolve_sample(sample.into())?;
        let scan = self.resolve_plan(plan.into())?;

        let mut collisions: Vec<String> = metadata
            .keys()
            .filter(|key| sample_md.contains_key(*key))
            .cloned()
            .collect();
        if !collisions.is_empty() {
            collisions.sort();
            return Err(AcqError::IllegalMetadata { keys: collisions });
        }

        let mut run_md = metadata;
        run_md.extend(sample_md);

        debug!(plan = scan.plan_type(), auto_dark = options.auto_dark, "invoking plan");
        let plan = self.wrap(scan, options.auto_dark);
        let uids = self
            .engine
            .execute(
                plan,
                &run_md,
                ExecuteOptions {
                    subs: options.subs,
                    verify_write: options.verify_write,
                    raise_if_interrupted: options.raise_if_interrupted,
                },
            )
            .await?;
        info!(runs = uids.len(), "plan finished");
        Ok(uids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beamtime::start_beamtime;
    use crate::experiment::plans::CommandList;
    use crate::experiment::run_engine::fast_settings;
    use crate::hardware::mock::MockDevices;
    use crate::metadata::metadata_from;
    use serde_json::json;
    use tracing_test::traced_test;

    fn rig(base: &std::path::Path) -> (MockDevices, CustomizedRunEngine) {
        let settings = fast_settings(base);
        let bt = start_beamtime(&settings, "Billinge", "300564", &[], Some(0.1812)).unwrap();
        let devices = MockDevices::new();
        let xrun = CustomizedRunEngine::new(bt, devices.device_set(), settings).unwrap();
        (devices, xrun)
    }

    fn ct(exposure: f64) -> PlanRef {
        PlanRef::named("ct", metadata_from([("exposure", json!(exposure))]))
    }

    #[tokio::test]
    async fn test_bad_sample_index_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (devices, xrun) = rig(dir.path());

        let err = xrun
            .invoke(99usize, ct(0.5), InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcqError::Resolution(_)));
        assert!(devices.log.entries().is_empty());
        assert!(xrun.dark_cache().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plan_name_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let (_devices, xrun) = rig(dir.path());

        let err = xrun
            .invoke(
                0usize,
                PlanRef::named("nope", MetadataMap::new()),
                InvokeOptions::default(),
                MetadataMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::Resolution(_)));

        let err = xrun
            .invoke(0usize, 42usize, InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_metadata_collision_rejected_before_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let (devices, xrun) = rig(dir.path());

        let err = xrun
            .invoke(
                0usize,
                ct(0.5),
                InvokeOptions::default(),
                metadata_from([("composition", json!("Cu")), ("operator", json!("tl"))]),
            )
            .await
            .unwrap_err();

        match err {
            AcqError::IllegalMetadata { keys } => assert_eq!(keys, vec!["composition"]),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(devices.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_short_exposure_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let (devices, xrun) = rig(dir.path());

        let err = xrun
            .invoke(0usize, ct(0.01), InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcqError::Configuration(_)));
        assert!(devices.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_stream_plan_gets_bracketed() {
        let dir = tempfile::tempdir().unwrap();
        let (devices, xrun) = rig(dir.path());
        let stream: Box<dyn Plan> = Box::new(CommandList::new("noop", vec![]));

        let uids = xrun
            .invoke(
                metadata_from([("name", json!("inline"))]),
                stream,
                InvokeOptions::default().auto_dark(false),
                MetadataMap::new(),
            )
            .await
            .unwrap();

        assert!(uids.is_empty());
        assert_eq!(devices.log.entries(), vec!["shutter:open", "shutter:closed"]);
    }

    #[tokio::test]
    async fn test_default_options_follow_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fast_settings(dir.path());
        settings.acquisition.auto_dark = false;
        let bt = start_beamtime(&settings, "Billinge", "1", &[], None).unwrap();
        let xrun =
            CustomizedRunEngine::new(bt, MockDevices::new().device_set(), settings).unwrap();

        assert!(!xrun.default_options().auto_dark);
        assert!(InvokeOptions::default().auto_dark);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dark_frames_are_announced() {
        let dir = tempfile::tempdir().unwrap();
        let (_devices, xrun) = rig(dir.path());

        xrun.invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap();
        assert!(logs_contain("inserting a dark-frame run"));
        assert!(logs_contain("no calibration file found"));

        xrun.invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap();
        assert!(logs_contain("reusing dark frame"));
    }
}
