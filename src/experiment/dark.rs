//! Dark-frame history and reuse decisions.
//!
//! A dark frame is an exposure taken with the shutter closed. Every completed
//! dark run is appended to a [`DarkFrameCache`]; before each light run,
//! [`validate_dark`] decides whether one of those records can still be
//! subtracted from it.
//!
//! A record qualifies for the current detector configuration when all of:
//!
//! ```text
//! |record.exposure - exposure|   <= acquire_time          (within one frame)
//!  record.acquire_time           == acquire_time          (same frame speed)
//!  now - record.timestamp        <= window_min*60 - acquire_time
//! ```
//!
//! Among qualifying records the freshest wins. Ties go to the record appended
//! last.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::AppResult;

/// When the interleaver may insert a dark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DarkPolicy {
    /// At most one dark run per invocation.
    #[default]
    OncePerInvocation,
    /// Re-check freshness before every light run; a new dark is taken
    /// whenever the cached one has expired.
    RevalidateEachRun,
}

/// One completed dark-frame run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkFrameRecord {
    /// Uid of the dark run.
    pub uid: String,
    /// Total exposure in seconds (acquire time × frames).
    pub exposure: f64,
    /// Per-frame acquire time in seconds.
    pub acquire_time: f64,
    /// Epoch seconds at completion.
    pub timestamp: f64,
}

impl DarkFrameRecord {
    /// Record for a dark run finished at `timestamp`.
    pub fn new(uid: &str, exposure: f64, acquire_time: f64, timestamp: f64) -> Self {
        Self {
            uid: uid.to_string(),
            exposure,
            acquire_time,
            timestamp,
        }
    }
}

/// Wall clock as fractional epoch seconds.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Pick the freshest record usable for a light exposure, if any.
pub fn validate_dark(
    entries: &[DarkFrameRecord],
    exposure: f64,
    acquire_time: f64,
    window_minutes: f64,
    now: f64,
) -> Option<&DarkFrameRecord> {
    let max_age = window_minutes * 60.0 - acquire_time;
    entries
        .iter()
        .filter(|entry| {
            (entry.exposure - exposure).abs() <= acquire_time
                && entry.acquire_time == acquire_time
                && now - entry.timestamp <= max_age
        })
        // max_by keeps the last of equal elements
        .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
}

/// Shared, append-only dark-frame history.
///
/// Clones share the same storage. An optional `limit` evicts the oldest
/// record once exceeded; an optional mirror path receives the full list as
/// YAML after every append.
#[derive(Debug, Clone, Default)]
pub struct DarkFrameCache {
    entries: Arc<RwLock<Vec<DarkFrameRecord>>>,
    limit: Option<usize>,
    mirror: Option<PathBuf>,
}

impl DarkFrameCache {
    /// Empty cache without limit or mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` records. `None` keeps everything.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Rewrite `path` after every append.
    pub fn with_mirror<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.mirror = Some(path.into());
        self
    }

    /// Restore a cache from its mirror file. A missing file yields an empty
    /// cache that will create the file on the first append.
    pub fn from_mirror<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let entries = Self::load_mirror(path)?;
        let cache = Self::new().with_mirror(path);
        *cache.entries.write() = entries;
        Ok(cache)
    }

    /// Read the records stored in a mirror file.
    pub fn load_mirror<P: AsRef<Path>>(path: P) -> AppResult<Vec<DarkFrameRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Append a record, evicting the oldest beyond the limit.
    ///
    /// A mirror write failure is logged and does not fail the append.
    pub fn record(&self, entry: DarkFrameRecord) {
        debug!(uid = %entry.uid, exposure = entry.exposure, "recording dark frame");
        let snapshot = {
            let mut entries = self.entries.write();
            entries.push(entry);
            if let Some(limit) = self.limit {
                let excess = entries.len().saturating_sub(limit);
                entries.drain(..excess);
            }
            self.mirror.as_ref().map(|_| entries.clone())
        };

        if let (Some(path), Some(entries)) = (&self.mirror, snapshot) {
            if let Err(e) = write_mirror(path, &entries) {
                warn!(path = %path.display(), error = %e, "failed to mirror dark-frame cache");
            }
        }
    }

    /// Records in insertion order.
    pub fn all(&self) -> Vec<DarkFrameRecord> {
        self.entries.read().clone()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no dark has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Uid of a usable dark for the given configuration, judged against the wall clock.
    pub fn validate(&self, exposure: f64, acquire_time: f64, window_minutes: f64) -> Option<String> {
        let entries = self.entries.read();
        validate_dark(&entries, exposure, acquire_time, window_minutes, now_epoch())
            .map(|entry| entry.uid.clone())
    }
}

fn write_mirror(path: &Path, entries: &[DarkFrameRecord]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_yaml::to_string(entries)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACQ: f64 = 0.1;

    fn record(uid: &str, exposure: f64, acquire_time: f64, timestamp: f64) -> DarkFrameRecord {
        DarkFrameRecord::new(uid, exposure, acquire_time, timestamp)
    }

    #[test]
    fn test_empty_cache_has_no_dark() {
        assert!(validate_dark(&[], 0.5, ACQ, 3000.0, 1000.0).is_none());
        assert!(DarkFrameCache::new().validate(0.5, ACQ, 3000.0).is_none());
    }

    #[test]
    fn test_exposure_tolerance_picks_matching_entry() {
        let now = 10_000.0;
        let entries: Vec<_> = (1..=5)
            .map(|i| record(&format!("dark-{}", i), f64::from(i) * 0.1, ACQ, now))
            .collect();

        let found = validate_dark(&entries, 0.5, ACQ, 3000.0, now).unwrap();
        assert_eq!(found.uid, "dark-5");
    }

    #[test]
    fn test_exposure_outside_one_frame_is_rejected() {
        let now = 10_000.0;
        let entries = vec![record("far", 0.2, ACQ, now)];
        assert!(validate_dark(&entries, 0.5, ACQ, 3000.0, now).is_none());
    }

    #[test]
    fn test_freshness_boundary() {
        let now = 100_000.0;
        let entries = vec![
            record("stale", 5.0, ACQ, now - 1140.0),
            record("fresh", 5.0, ACQ, now - 60.0),
            record("older", 5.0, ACQ, now - 600.0),
        ];

        let found = validate_dark(&entries, 5.0, ACQ, 11.0, now).unwrap();
        assert_eq!(found.uid, "fresh");

        assert!(validate_dark(&entries, 5.0, ACQ, 0.9, now).is_none());

        let found = validate_dark(&entries, 5.0, ACQ, 22.0, now).unwrap();
        assert_eq!(found.uid, "fresh");
    }

    #[test]
    fn test_guard_band_subtracts_acquire_time() {
        let now = 1_000.0;
        // Exactly one minute old: inside a 1 min window only without the guard band.
        let entries = vec![record("edge", 1.0, ACQ, now - 60.0)];
        assert!(validate_dark(&entries, 1.0, ACQ, 1.0, now).is_none());
        assert!(validate_dark(&entries, 1.0, ACQ, 1.01, now).is_some());
    }

    #[test]
    fn test_acquire_time_must_match_exactly() {
        let now = 5_000.0;
        let entries = vec![
            record("fast", 1.0, 0.1, now),
            record("slow", 1.0, 0.2, now),
        ];

        assert_eq!(validate_dark(&entries, 1.0, 0.1, 60.0, now).unwrap().uid, "fast");
        assert_eq!(validate_dark(&entries, 1.0, 0.2, 60.0, now).unwrap().uid, "slow");
        assert!(validate_dark(&entries, 1.0, 0.5, 60.0, now).is_none());
    }

    #[test]
    fn test_freshest_wins_over_last_appended() {
        let now = 5_000.0;
        let entries = vec![record("new", 1.0, ACQ, now - 10.0), record("old", 1.0, ACQ, now - 300.0)];
        assert_eq!(validate_dark(&entries, 1.0, ACQ, 60.0, now).unwrap().uid, "new");
    }

    #[test]
    fn test_cache_is_shared_between_clones() {
        let cache = DarkFrameCache::new();
        let handle = cache.clone();
        handle.record(record("a", 1.0, ACQ, now_epoch()));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.validate(1.0, ACQ, 10.0).as_deref(), Some("a"));
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let cache = DarkFrameCache::new().with_limit(Some(2));
        for uid in ["a", "b", "c"] {
            cache.record(record(uid, 1.0, ACQ, 1.0));
        }
        let uids: Vec<_> = cache.all().into_iter().map(|e| e.uid).collect();
        assert_eq!(uids, vec!["b", "c"]);
    }

    #[test]
    fn test_mirror_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_base").join("dark_frames.yml");

        let cache = DarkFrameCache::new().with_mirror(&path);
        cache.record(record("a", 0.5, ACQ, 42.0));
        cache.record(record("b", 1.0, ACQ, 43.0));

        let restored = DarkFrameCache::from_mirror(&path).unwrap();
        assert_eq!(restored.all(), cache.all());
    }

    #[test]
    fn test_dark_policy_serde_names() {
        let policy: DarkPolicy = serde_yaml::from_str("revalidate_each_run").unwrap();
        assert_eq!(policy, DarkPolicy::RevalidateEachRun);
        assert_eq!(DarkPolicy::default(), DarkPolicy::OncePerInvocation);
    }
}
