//! Calibration file lookup.
//!
//! The newest calibration file in the calibration directory describes the
//! current detector geometry. It is re-read for every run so a recalibration
//! between scans is picked up without restarting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::{AcqError, AppResult};

/// A parsed calibration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    /// Name of the file the parameters were read from
    pub file_name: String,
    /// File contents as a JSON value
    pub parameters: Value,
}

/// Parse the most recently modified `*.<extension>` file in `dir`.
///
/// Returns `Ok(None)` when the directory is missing or holds no such file.
pub fn latest_calibration(dir: &Path, extension: &str) -> AppResult<Option<CalibrationInfo>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut newest: Option<(SystemTime, String)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let candidate = (modified, name);
        if newest.as_ref().map_or(true, |current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    let Some((_, file_name)) = newest else {
        return Ok(None);
    };

    let text = fs::read_to_string(dir.join(&file_name))?;
    let parameters: Value = serde_yaml::from_str(&text)?;
    if !parameters.is_object() {
        return Err(AcqError::Persistence(format!(
            "calibration file '{}' does not contain a mapping",
            file_name
        )));
    }

    Ok(Some(CalibrationInfo {
        file_name,
        parameters,
    }))
}
