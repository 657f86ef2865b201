//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file (`xpd_acq.toml` by default)
//! 3. Environment variables prefixed with `XPDACQ_` (`__` separates sections)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! XPDACQ_APPLICATION__LOG_LEVEL=debug
//! XPDACQ_ACQUISITION__FRAME_ACQ_TIME=0.2
//! XPDACQ_ACQUISITION__SHUTTER_SETTLE=500ms
//! XPDACQ_PATHS__BASE_DIR=/tmp/sim
//! ```
//!
//! Settings are loaded once by the startup routine and passed by handle to the
//! components that need them. Nothing reads configuration at import time.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AcqError, AppResult};
use crate::experiment::dark::DarkPolicy;

/// Default settings file looked up by [`Settings::load`].
pub const DEFAULT_CONFIG_FILE: &str = "xpd_acq.toml";

const HOME_DIR_NAME: &str = "xpdUser";
const CONFIG_BASE_NAME: &str = "config_base";
const YAML_DIR_NAME: &str = "yml";
const RUN_LOG_DIR_NAME: &str = "runs";

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logging and runtime behaviour
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Directory layout
    #[serde(default)]
    pub paths: PathConfig,
    /// Detector, shutter and dark-frame handling
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Facility metadata
    #[serde(default)]
    pub beamline: BeamlineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Directory layout. Only `base_dir` is required; everything else derives from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    /// Root of the `xpdConfig` and `userAnalysis` trees
    pub base_dir: PathBuf,
    /// Where calibration files are written; defaults to the config base.
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,
    /// Where run documents are logged for write verification.
    #[serde(default)]
    pub run_log_dir: Option<PathBuf>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            base_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            calibration_dir: None,
            run_log_dir: None,
        }
    }
}

/// Acquisition behaviour: detector framing, dark scheduling, shutter timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Per-frame integration time of the area detector, in seconds
    pub frame_acq_time: f64,
    /// Maximum age of a reusable dark frame, in minutes
    pub dark_window_minutes: f64,
    /// Take and reuse dark frames automatically
    pub auto_dark: bool,
    /// Open and close the shutter around light exposures
    pub shutter_control: bool,
    /// When the cached dark is re-checked inside one invocation
    #[serde(default)]
    pub dark_policy: DarkPolicy,
    /// Keep at most this many dark records; oldest evicted first
    #[serde(default)]
    pub dark_cache_limit: Option<usize>,
    /// Mirror the dark cache to `<yaml_dir>/dark_frames.yml`
    #[serde(default)]
    pub dark_cache_mirror: bool,
    /// Pause after moving the shutter, letting the detector settle
    #[serde(with = "humantime_serde")]
    pub shutter_settle: Duration,
    /// Delay between shutter position reads
    #[serde(with = "humantime_serde")]
    pub shutter_poll_interval: Duration,
    /// Give up on the shutter after this long
    #[serde(with = "humantime_serde")]
    pub shutter_timeout: Duration,
    /// Upper bound for any single device operation
    #[serde(with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Attach the newest calibration file to every run
    #[serde(default = "default_true")]
    pub auto_load_calib: bool,
    /// File extension of calibration files
    pub calibration_extension: String,
}

fn default_true() -> bool {
    true
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            frame_acq_time: 0.1,
            dark_window_minutes: 3000.0,
            auto_dark: true,
            shutter_control: true,
            dark_policy: DarkPolicy::default(),
            dark_cache_limit: None,
            dark_cache_mirror: false,
            shutter_settle: Duration::from_secs(2),
            shutter_poll_interval: Duration::from_millis(50),
            shutter_timeout: Duration::from_secs(10),
            device_timeout: Duration::from_secs(60),
            auto_load_calib: true,
            calibration_extension: "yml".to_string(),
        }
    }
}

/// Facility metadata stamped on every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeamlineConfig {
    /// Account the data is owned by
    pub owner: String,
    /// Short beamline name
    pub beamline_id: String,
    /// Beamline group name
    pub group: String,
    /// Version of the metadata layout
    pub md_version: f64,
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        Self {
            owner: "xf28id1".to_string(),
            beamline_id: "xpd".to_string(),
            group: "XPD".to_string(),
            md_version: 0.1,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            paths: PathConfig::default(),
            acquisition: AcquisitionConfig::default(),
            beamline: BeamlineConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("XPDACQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults rooted at `base_dir`; used by simulations and tests.
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        let mut settings = Self::default();
        settings.paths.base_dir = base_dir.into();
        settings
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if !(acq.frame_acq_time.is_finite() && acq.frame_acq_time > 0.0) {
            return Err(AcqError::Configuration(format!(
                "frame_acq_time must be a positive number, got {}",
                acq.frame_acq_time
            )));
        }
        if !(acq.dark_window_minutes.is_finite() && acq.dark_window_minutes >= 0.0) {
            return Err(AcqError::Configuration(format!(
                "dark_window_minutes must be >= 0, got {}",
                acq.dark_window_minutes
            )));
        }
        if acq.shutter_poll_interval.is_zero() {
            return Err(AcqError::Configuration(
                "shutter_poll_interval must be non-zero".to_string(),
            ));
        }
        if acq.dark_cache_limit == Some(0) {
            return Err(AcqError::Configuration(
                "dark_cache_limit must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// `<base_dir>/xpdUser`
    pub fn home_dir(&self) -> PathBuf {
        self.paths.base_dir.join(HOME_DIR_NAME)
    }

    /// `<base_dir>/xpdConfig`
    pub fn config_base(&self) -> PathBuf {
        self.home_dir().join(CONFIG_BASE_NAME)
    }

    /// Where the beamtime entity files live.
    pub fn yaml_dir(&self) -> PathBuf {
        self.config_base().join(YAML_DIR_NAME)
    }

    /// Where calibration files are looked up.
    pub fn calibration_dir(&self) -> PathBuf {
        self.paths
            .calibration_dir
            .clone()
            .unwrap_or_else(|| self.config_base())
    }

    /// Per-run JSONL logs written when write verification is on.
    pub fn run_log_dir(&self) -> PathBuf {
        self.paths
            .run_log_dir
            .clone()
            .unwrap_or_else(|| self.home_dir().join(RUN_LOG_DIR_NAME))
    }

    /// Mirror file of the dark-frame cache.
    pub fn dark_mirror_path(&self) -> PathBuf {
        self.yaml_dir().join("dark_frames.yml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.acquisition.frame_acq_time, 0.1);
        assert_eq!(settings.acquisition.dark_window_minutes, 3000.0);
        assert!(settings.acquisition.auto_dark);
    }

    #[test]
    fn test_derived_paths() {
        let settings = Settings::with_base_dir("/data");
        assert_eq!(settings.home_dir(), PathBuf::from("/data/xpdUser"));
        assert_eq!(
            settings.yaml_dir(),
            PathBuf::from("/data/xpdUser/config_base/yml")
        );
        assert_eq!(settings.calibration_dir(), settings.config_base());
        assert_eq!(settings.run_log_dir(), PathBuf::from("/data/xpdUser/runs"));
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[acquisition]
frame_acq_time = 0.2
dark_window_minutes = 60.0
auto_dark = false
shutter_control = true
shutter_settle = "250ms"
shutter_poll_interval = "10ms"
shutter_timeout = "1s"
device_timeout = "5s"
calibration_extension = "yaml"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.acquisition.frame_acq_time, 0.2);
        assert!(!settings.acquisition.auto_dark);
        assert_eq!(
            settings.acquisition.shutter_settle,
            Duration::from_millis(250)
        );
        assert_eq!(settings.acquisition.calibration_extension, "yaml");
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("XPDACQ_APPLICATION__LOG_LEVEL", "debug");
        let settings = Settings::load_from("does-not-exist.toml");
        std::env::remove_var("XPDACQ_APPLICATION__LOG_LEVEL");

        assert_eq!(settings.unwrap().application.log_level, "debug");
    }

    #[test]
    fn test_rejects_bad_frame_time() {
        let mut settings = Settings::default();
        settings.acquisition.frame_acq_time = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(AcqError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }
}
