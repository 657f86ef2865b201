//! Beamtime, experiment, sample and scan-plan entities.
//!
//! Experiments and samples chain onto the beamtime; scan plans chain onto an
//! experiment. Each entity is a cheap handle: clones share the same metadata
//! layers, so an edit is visible through every handle and every descendant.
//!
//! Mutations go through the [`Beamtime`], which rewrites the affected files
//! (the edited entity and every file that embeds its layer) right away.

use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AcqError, AppResult};
use crate::experiment::plans::summarize;
use crate::experiment::templates::{ScanKind, ScanParams, ScanSequence};
use crate::metadata::{metadata_from, ChainMap, MetadataMap};

use super::store::{EntityFile, YamlStore};

/// Metadata key of the beamtime uid.
pub const BEAMTIME_UID: &str = "beamtime_uid";
/// Metadata key of the experiment uid.
pub const EXPERIMENT_UID: &str = "experiment_uid";
/// Metadata key of the sample uid.
pub const SAMPLE_UID: &str = "sample_uid";
/// Metadata key of the scan-plan uid.
pub const SCANPLAN_UID: &str = "scanplan_uid";

/// First 8 characters of a v4 uuid.
pub fn new_short_uid() -> String {
    let mut uid = Uuid::new_v4().simple().to_string();
    uid.truncate(8);
    uid
}

fn sync_chain(path: &Path, md: &ChainMap, hidden: bool, order: usize) -> AppResult<()> {
    EntityFile {
        hidden,
        order,
        layers: md.snapshot_layers(),
    }
    .write(path)
}

fn str_field(md: &ChainMap, key: &str) -> String {
    md.get_str(key).unwrap_or_default()
}

/// A named group of scan plans within a beamtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub(crate) md: ChainMap,
    pub(crate) path: PathBuf,
    pub(crate) order: usize,
}

impl Experiment {
    /// Experiment name, from `experiment_name`.
    pub fn name(&self) -> String {
        str_field(&self.md, "experiment_name")
    }

    /// Uid generated when the experiment was added.
    pub fn uid(&self) -> String {
        str_field(&self.md, EXPERIMENT_UID)
    }

    /// Read-through metadata: the experiment's own layer, then the beamtime's.
    pub fn md(&self) -> &ChainMap {
        &self.md
    }

    /// Backing YAML file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync(&self) -> AppResult<()> {
        sync_chain(&self.path, &self.md, false, self.order)
    }
}

/// A physical sample. Its flattened metadata goes into every run taken on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub(crate) md: ChainMap,
    pub(crate) path: PathBuf,
    pub(crate) order: usize,
    pub(crate) hidden: bool,
}

impl Sample {
    /// Sample name, from `name`.
    pub fn name(&self) -> String {
        str_field(&self.md, "name")
    }

    /// Uid generated when the sample was added.
    pub fn uid(&self) -> String {
        str_field(&self.md, SAMPLE_UID)
    }

    /// Read-through metadata: the sample's own layer, then the beamtime's.
    pub fn md(&self) -> &ChainMap {
        &self.md
    }

    /// Backing YAML file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hidden samples are skipped by index lookup and listings.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    fn sync(&self) -> AppResult<()> {
        sync_chain(&self.path, &self.md, self.hidden, self.order)
    }
}

/// A reusable binding of a scan template to its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub(crate) md: ChainMap,
    pub(crate) params: ScanParams,
    pub(crate) path: PathBuf,
    pub(crate) order: usize,
    pub(crate) hidden: bool,
}

impl ScanPlan {
    /// Own layer for `params`: `plan_name`, `params`, `scanplan_uid`.
    fn own_layer(params: &ScanParams) -> MetadataMap {
        let params_md: serde_json::Map<String, Value> = params.to_metadata().into_iter().collect();
        metadata_from([
            ("plan_name", json!(params.kind().as_str())),
            ("params", Value::Object(params_md)),
            (SCANPLAN_UID, json!(new_short_uid())),
        ])
    }

    /// Recover the parameters from a persisted own layer.
    pub(crate) fn params_from_layer(own: &MetadataMap) -> AppResult<ScanParams> {
        let kind: ScanKind = own
            .get("plan_name")
            .and_then(Value::as_str)
            .ok_or_else(|| AcqError::Persistence("scan plan without plan_name".to_string()))?
            .parse()?;
        let params: MetadataMap = match own.get("params") {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => MetadataMap::new(),
        };
        ScanParams::from_metadata(kind, &params)
    }

    /// Parameters the plan was registered with.
    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    /// Template the plan is built from.
    pub fn kind(&self) -> ScanKind {
        self.params.kind()
    }

    /// Uid generated when the scan plan was registered.
    pub fn uid(&self) -> String {
        str_field(&self.md, SCANPLAN_UID)
    }

    /// Scan-plan metadata. Its parameters are kept under `params`.
    pub fn md(&self) -> &ChainMap {
        &self.md
    }

    /// Backing YAML file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hidden scan plans are skipped by index lookup and listings.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Build the acquisition sequence, tagged with this plan's uid.
    pub fn factory(&self, frame_acq_time: f64) -> AppResult<ScanSequence> {
        Ok(self
            .params
            .build(frame_acq_time)?
            .with_metadata(metadata_from([(SCANPLAN_UID, json!(self.uid()))])))
    }

    /// Dry-run rendering of the sequence this plan produces.
    pub fn summary(&self, frame_acq_time: f64) -> AppResult<String> {
        let mut plan = self.factory(frame_acq_time)?;
        Ok(summarize(&mut plan))
    }

    fn sync(&self) -> AppResult<()> {
        sync_chain(&self.path, &self.md, self.hidden, self.order)
    }
}

impl fmt::Display for ScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.params.args().join(", "))
    }
}

/// Root of the metadata hierarchy for one beamtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Beamtime {
    pub(crate) md: ChainMap,
    pub(crate) store: YamlStore,
    pub(crate) experiments: Vec<Experiment>,
    pub(crate) samples: Vec<Sample>,
    pub(crate) scanplans: Vec<ScanPlan>,
}

impl Beamtime {
    /// Create a beamtime and write `bt_bt.yml`.
    pub fn new(store: YamlStore, pi_name: &str, saf_num: &str, extra: MetadataMap) -> AppResult<Self> {
        if pi_name.trim().is_empty() || saf_num.trim().is_empty() {
            return Err(AcqError::Configuration(
                "a beamtime requires pi_name and saf_num".to_string(),
            ));
        }
        let mut own = extra;
        own.insert("pi_name".to_string(), json!(pi_name));
        own.insert("saf_num".to_string(), json!(saf_num));
        let md = ChainMap::new(own);
        md.set_default(BEAMTIME_UID, json!(new_short_uid()));

        let bt = Self {
            md,
            store,
            experiments: Vec::new(),
            samples: Vec::new(),
            scanplans: Vec::new(),
        };
        bt.sync()?;
        info!(uid = %bt.uid(), pi_name, saf_num, "beamtime created");
        Ok(bt)
    }

    /// Principal investigator.
    pub fn pi_name(&self) -> String {
        str_field(&self.md, "pi_name")
    }

    /// Safety approval form number.
    pub fn saf_num(&self) -> String {
        str_field(&self.md, "saf_num")
    }

    /// Uid generated when the beamtime was started.
    pub fn uid(&self) -> String {
        str_field(&self.md, BEAMTIME_UID)
    }

    /// Beamtime metadata, the root layer of every entity chain.
    pub fn md(&self) -> &ChainMap {
        &self.md
    }

    /// Store the entities are written through to.
    pub fn store(&self) -> &YamlStore {
        &self.store
    }

    /// Set a beamtime field; every descendant sees it and is re-synced.
    pub fn set(&self, key: &str, value: Value) -> AppResult<()> {
        self.md.insert(key, value);
        self.sync_all()
    }

    /// Remove a beamtime field and re-sync every file.
    ///
    /// Returns the previous value, if any.
    pub fn remove(&self, key: &str) -> AppResult<Option<Value>> {
        let old = self.md.own_layer().remove(key);
        self.sync_all()?;
        Ok(old)
    }

    /// All experiments, in registration order.
    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    /// Look up an experiment by name.
    pub fn experiment(&self, name: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.name() == name)
    }

    /// Visible samples, in registration order.
    pub fn samples(&self) -> Vec<&Sample> {
        self.samples.iter().filter(|s| !s.hidden).collect()
    }

    /// Visible scan plans, in registration order.
    pub fn scanplans(&self) -> Vec<&ScanPlan> {
        self.scanplans.iter().filter(|s| !s.hidden).collect()
    }

    /// The `index`-th visible sample.
    pub fn sample(&self, index: usize) -> AppResult<&Sample> {
        let samples = self.samples();
        let count = samples.len();
        samples.get(index).copied().ok_or_else(|| {
            AcqError::Resolution(format!(
                "sample index {} out of range ({} samples)",
                index, count
            ))
        })
    }

    /// The `index`-th visible scan plan.
    pub fn scanplan(&self, index: usize) -> AppResult<&ScanPlan> {
        let scanplans = self.scanplans();
        let count = scanplans.len();
        scanplans.get(index).copied().ok_or_else(|| {
            AcqError::Resolution(format!(
                "scan plan index {} out of range ({} scan plans)",
                index, count
            ))
        })
    }

    /// Add an experiment under this beamtime and write its file.
    ///
    /// Fails with [`AcqError::Configuration`] when the name is taken or another
    /// experiment's name maps to the same file.
    pub fn add_experiment(&mut self, name: &str, extra: MetadataMap) -> AppResult<Experiment> {
        if self.experiment(name).is_some() {
            return Err(AcqError::Configuration(format!(
                "experiment '{}' already exists",
                name
            )));
        }
        let path = self.store.experiment_path(name);
        if let Some(other) = self.experiments.iter().find(|e| e.path == path) {
            return Err(AcqError::Configuration(format!(
                "experiment '{}' would share {} with experiment '{}'",
                name,
                path.display(),
                other.name()
            )));
        }
        let mut own = extra;
        own.insert("experiment_name".to_string(), json!(name));
        own.insert(EXPERIMENT_UID.to_string(), json!(new_short_uid()));

        let experiment = Experiment {
            md: ChainMap::with_parent(own, &self.md),
            path,
            order: self.experiments.len(),
        };
        experiment.sync()?;
        debug!(name, path = %experiment.path.display(), "experiment created");
        self.experiments.push(experiment.clone());
        Ok(experiment)
    }

    /// Add a sample and write its file.
    ///
    /// `composition` is stored under `composition`; `extra` fields go into the
    /// sample's own layer. Names that would share a file with an existing sample
    /// are rejected.
    pub fn add_sample(&mut self, name: &str, composition: Value, extra: MetadataMap) -> AppResult<Sample> {
        if name.trim().is_empty() {
            return Err(AcqError::Configuration(
                "a sample requires a name".to_string(),
            ));
        }
        if self.samples.iter().any(|s| s.name() == name) {
            return Err(AcqError::Configuration(format!(
                "sample '{}' already exists",
                name
            )));
        }
        let path = self.store.sample_path(name);
        if let Some(other) = self.samples.iter().find(|s| s.path == path) {
            return Err(AcqError::Configuration(format!(
                "sample '{}' would share {} with sample '{}'",
                name,
                path.display(),
                other.name()
            )));
        }
        let mut own = extra;
        own.insert("name".to_string(), json!(name));
        own.insert("composition".to_string(), composition);
        own.insert(SAMPLE_UID.to_string(), json!(new_short_uid()));

        let sample = Sample {
            md: ChainMap::with_parent(own, &self.md),
            path,
            order: self.samples.len(),
            hidden: false,
        };
        sample.sync()?;
        debug!(name, path = %sample.path.display(), "sample created");
        self.samples.push(sample.clone());
        Ok(sample)
    }

    /// Register a scan plan under `experiment`.
    ///
    /// Parameters identical to an existing plan return that plan instead of a
    /// duplicate.
    pub fn add_scanplan(&mut self, experiment: &Experiment, params: ScanParams) -> AppResult<ScanPlan> {
        let path = self.store.scanplan_path(&params);
        if let Some(existing) = self.scanplans.iter().find(|sp| sp.path == path) {
            return Ok(existing.clone());
        }

        let scanplan = ScanPlan {
            md: ChainMap::with_parent(ScanPlan::own_layer(&params), &experiment.md),
            params,
            path,
            order: self.scanplans.len(),
            hidden: false,
        };
        scanplan.sync()?;
        debug!(scanplan = %scanplan, path = %scanplan.path.display(), "scan plan created");
        self.scanplans.push(scanplan.clone());
        Ok(scanplan)
    }

    /// Hide or unhide a sample by name. The file is rewritten; the sample
    /// keeps its uid.
    pub fn set_sample_hidden(&mut self, name: &str, hidden: bool) -> AppResult<()> {
        let sample = self
            .samples
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| AcqError::Resolution(format!("no sample named '{}'", name)))?;
        sample.hidden = hidden;
        sample.sync()
    }

    /// Hide or unhide a scan plan by uid.
    pub fn set_scanplan_hidden(&mut self, uid: &str, hidden: bool) -> AppResult<()> {
        let scanplan = self
            .scanplans
            .iter_mut()
            .find(|sp| sp.uid() == uid)
            .ok_or_else(|| AcqError::Resolution(format!("no scan plan with uid '{}'", uid)))?;
        scanplan.hidden = hidden;
        scanplan.sync()
    }

    fn sync(&self) -> AppResult<()> {
        sync_chain(&self.store.beamtime_path(), &self.md, false, 0)
    }

    /// Rewrite every entity file.
    pub fn sync_all(&self) -> AppResult<()> {
        self.sync()?;
        for experiment in &self.experiments {
            experiment.sync()?;
        }
        for sample in &self.samples {
            sample.sync()?;
        }
        for scanplan in &self.scanplans {
            scanplan.sync()?;
        }
        Ok(())
    }
}

impl fmt::Display for Beamtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiments:")?;
        for (i, experiment) in self.experiments.iter().enumerate() {
            writeln!(f, "{}: {}", i, experiment.name())?;
        }
        writeln!(f)?;
        writeln!(f, "ScanPlans:")?;
        for (i, scanplan) in self.scanplans().iter().enumerate() {
            writeln!(f, "{}: {}", i, scanplan)?;
        }
        writeln!(f)?;
        write!(f, "Samples:")?;
        for (i, sample) in self.samples().iter().enumerate() {
            write!(f, "\n{}: {}", i, sample.name())?;
        }
        Ok(())
    }
}
