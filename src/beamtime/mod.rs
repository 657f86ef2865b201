//! Beamtime hierarchy and its YAML persistence.
//!
//! - [`entities`]: `Beamtime`, `Experiment`, `Sample`, `ScanPlan`
//! - [`store`]: file layout and the per-entity file format
//!
//! [`start_beamtime`] sets up a fresh beamtime; [`load_beamtime`] rebuilds
//! one from disk, re-linking every child to its ancestors by uid so that
//! edits keep propagating after a reload.

pub mod entities;
pub mod store;

pub use entities::{new_short_uid, Beamtime, Experiment, Sample, ScanPlan};
pub use store::{EntityFile, YamlStore};

use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AcqError, AppResult};
use crate::experiment::templates::ScanParams;
use crate::metadata::{ChainMap, Layer, MetadataMap};

use entities::{BEAMTIME_UID, EXPERIMENT_UID};
use store::{EXPERIMENTS_DIR, SAMPLES_DIR, SCANPLANS_DIR};

/// Exposures (seconds) of the `ct` plans every new beamtime starts with.
pub const DEFAULT_EXPOSURES: [f64; 6] = [0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

/// Experiment created by [`start_beamtime`].
pub const DEFAULT_EXPERIMENT: &str = "default";
/// Sample created by [`start_beamtime`].
pub const DEFAULT_SAMPLE: &str = "Ni";

/// Create the directory layout and a new beamtime with default entries.
///
/// Fails if a beamtime already exists under the settings' yaml directory.
pub fn start_beamtime(
    settings: &Settings,
    pi_name: &str,
    saf_num: &str,
    experimenters: &[String],
    wavelength: Option<f64>,
) -> AppResult<Beamtime> {
    let store = YamlStore::new(settings.yaml_dir());
    if store.beamtime_path().exists() {
        return Err(AcqError::Configuration(format!(
            "a beamtime already exists at {}",
            store.beamtime_path().display()
        )));
    }

    for dir in [
        settings.home_dir(),
        settings.config_base(),
        settings.calibration_dir(),
        settings.run_log_dir(),
    ] {
        fs::create_dir_all(dir)?;
    }
    store.create_layout()?;
    info!(home = %settings.home_dir().display(), "initiated required directories");

    // PI first, then everyone else once.
    let mut people = vec![pi_name.to_string()];
    for name in experimenters {
        if !people.contains(name) {
            people.push(name.clone());
        }
    }
    let mut extra = MetadataMap::new();
    extra.insert("experimenters".to_string(), json!(people));
    if let Some(wavelength) = wavelength {
        extra.insert("wavelength".to_string(), json!(wavelength));
    }

    let mut bt = Beamtime::new(store, pi_name, saf_num, extra)?;
    let experiment = bt.add_experiment(DEFAULT_EXPERIMENT, MetadataMap::new())?;
    bt.add_sample(DEFAULT_SAMPLE, json!(DEFAULT_SAMPLE), MetadataMap::new())?;
    for exposure in DEFAULT_EXPOSURES {
        bt.add_scanplan(&experiment, ScanParams::Count { exposure })?;
    }
    info!(
        scanplans = DEFAULT_EXPOSURES.len(),
        "beamtime ready with default ct scan plans"
    );
    Ok(bt)
}

/// Load the beamtime under the settings' yaml directory, if there is one.
pub fn open_beamtime(settings: &Settings) -> AppResult<Option<Beamtime>> {
    let dir = settings.yaml_dir();
    if !YamlStore::new(&dir).beamtime_path().is_file() {
        info!(dir = %dir.display(), "no beamtime found");
        return Ok(None);
    }
    load_beamtime(&dir).map(Some)
}

fn layer_uid(file: &EntityFile, index: usize, key: &str) -> Option<String> {
    file.layers
        .get(index)
        .and_then(|layer| layer.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Chain for a child file: linked to `parent` when given, otherwise rebuilt
/// from the ancestor copies stored in the file itself.
fn relink(file: &EntityFile, parent: Option<&ChainMap>, path: &Path) -> ChainMap {
    match parent {
        Some(parent) => ChainMap::with_parent(file.own().clone(), parent),
        None => {
            warn!(path = %path.display(), "parent not found, loading detached copy");
            ChainMap::from_layers(file.layers.iter().cloned().map(Layer::new).collect())
        }
    }
}

/// Rebuild a beamtime and all its children from `dir`.
pub fn load_beamtime(dir: &Path) -> AppResult<Beamtime> {
    let store = YamlStore::new(dir);
    let bt_file = EntityFile::read(&store.beamtime_path())?;
    for key in ["pi_name", "saf_num", BEAMTIME_UID] {
        if !bt_file.own().contains_key(key) {
            return Err(AcqError::Persistence(format!(
                "{} is missing '{}'",
                store.beamtime_path().display(),
                key
            )));
        }
    }

    let mut bt = Beamtime {
        md: ChainMap::new(bt_file.own().clone()),
        store,
        experiments: Vec::new(),
        samples: Vec::new(),
        scanplans: Vec::new(),
    };
    let bt_uid = bt.uid();

    for path in bt.store.list(EXPERIMENTS_DIR)? {
        let file = EntityFile::read(&path)?;
        let linked = layer_uid(&file, 1, BEAMTIME_UID).as_deref() == Some(bt_uid.as_str());
        bt.experiments.push(Experiment {
            md: relink(&file, linked.then_some(&bt.md), &path),
            path,
            order: file.order,
        });
    }
    bt.experiments.sort_by_key(|e| e.order);

    for path in bt.store.list(SAMPLES_DIR)? {
        let file = EntityFile::read(&path)?;
        let linked = layer_uid(&file, 1, BEAMTIME_UID).as_deref() == Some(bt_uid.as_str());
        bt.samples.push(Sample {
            md: relink(&file, linked.then_some(&bt.md), &path),
            path,
            order: file.order,
            hidden: file.hidden,
        });
    }
    bt.samples.sort_by_key(|s| s.order);

    for path in bt.store.list(SCANPLANS_DIR)? {
        let file = EntityFile::read(&path)?;
        let parent = layer_uid(&file, 1, EXPERIMENT_UID)
            .and_then(|uid| bt.experiments.iter().find(|e| e.uid() == uid))
            .map(|e| e.md.clone());
        let params = ScanPlan::params_from_layer(file.own())?;
        bt.scanplans.push(ScanPlan {
            md: relink(&file, parent.as_ref(), &path),
            params,
            path,
            order: file.order,
            hidden: file.hidden,
        });
    }
    bt.scanplans.sort_by_key(|s| s.order);

    info!(
        uid = %bt_uid,
        experiments = bt.experiments.len(),
        samples = bt.samples.len(),
        scanplans = bt.scanplans.len(),
        "beamtime loaded"
    );
    Ok(bt)
}
