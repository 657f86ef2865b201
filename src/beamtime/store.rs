//! On-disk layout of the beamtime entities.
//!
//! Every entity is one YAML file holding its metadata layers, child first:
//!
//! ```text
//! <yaml_dir>/
//!   bt_bt.yml
//!   experiments/ex_<name>.yml
//!   samples/sa_<name>.yml
//!   scanplans/sp_<kind>_<args>.yml
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AcqError, AppResult};
use crate::experiment::templates::ScanParams;
use crate::metadata::MetadataMap;

/// Subdirectory holding experiment files.
pub const EXPERIMENTS_DIR: &str = "experiments";
/// Subdirectory holding sample files.
pub const SAMPLES_DIR: &str = "samples";
/// Subdirectory holding scan-plan files.
pub const SCANPLANS_DIR: &str = "scanplans";

const FILE_EXT: &str = "yml";

/// Contents of one entity file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFile {
    /// Hidden entities stay on disk but are left out of listings
    #[serde(default)]
    pub hidden: bool,
    /// Position in the beamtime's listing
    #[serde(default)]
    pub order: usize,
    /// Metadata layers, own layer first
    pub layers: Vec<MetadataMap>,
}

impl EntityFile {
    /// Parse an entity file.
    pub fn read(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        let file: Self = serde_yaml::from_str(&text)?;
        if file.layers.is_empty() {
            return Err(AcqError::Persistence(format!(
                "{} holds no metadata",
                path.display()
            )));
        }
        Ok(file)
    }

    /// Write the file, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// The entity's own layer.
    pub fn own(&self) -> &MetadataMap {
        &self.layers[0]
    }
}

/// Keep file names portable whatever the entity is called.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolves entity file paths under one root directory.
#[derive(Debug, Clone, PartialEq)]
pub struct YamlStore {
    root: PathBuf,
}

impl YamlStore {
    /// Store rooted at the beamtime's YAML directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Directory the store writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the entity subdirectories.
    pub fn create_layout(&self) -> AppResult<()> {
        for sub in [EXPERIMENTS_DIR, SAMPLES_DIR, SCANPLANS_DIR] {
            fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    /// File of the beamtime itself.
    pub fn beamtime_path(&self) -> PathBuf {
        self.root.join(format!("bt_bt.{}", FILE_EXT))
    }

    /// File of the experiment called `name`. Characters other than ASCII
    /// alphanumerics, `-`, `_` and `.` become `_`.
    pub fn experiment_path(&self, name: &str) -> PathBuf {
        self.root
            .join(EXPERIMENTS_DIR)
            .join(format!("ex_{}.{}", file_stem(name), FILE_EXT))
    }

    /// File of the sample called `name`, named as for experiments.
    pub fn sample_path(&self, name: &str) -> PathBuf {
        self.root
            .join(SAMPLES_DIR)
            .join(format!("sa_{}.{}", file_stem(name), FILE_EXT))
    }

    /// Identical parameters always map to the same file.
    pub fn scanplan_path(&self, params: &ScanParams) -> PathBuf {
        let name = std::iter::once(params.kind().as_str().to_string())
            .chain(params.args())
            .collect::<Vec<_>>()
            .join("_");
        self.root
            .join(SCANPLANS_DIR)
            .join(format!("sp_{}.{}", file_stem(&name), FILE_EXT))
    }

    /// Entity files in `sub`, sorted by name. A missing directory is empty.
    pub fn list(&self, sub: &str) -> AppResult<Vec<PathBuf>> {
        let dir = self.root.join(sub);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(FILE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
