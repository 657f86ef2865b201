//! End-to-end acquisition scenarios against the simulated devices.
//!
//! Run with: cargo test --test acquisition_workflow

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use xpd_acq::beamtime::{start_beamtime, Beamtime};
use xpd_acq::config::Settings;
use xpd_acq::experiment::{
    CustomizedRunEngine, Document, DocumentCallback, InvokeOptions, PlanRef, ScanParams,
    StartDoc,
};
use xpd_acq::hardware::mock::MockDevices;
use xpd_acq::hardware::ShutterState;
use xpd_acq::metadata::{metadata_from, MetadataMap};

const DARK_FIELD_UID: &str = "dark-field-uid";

fn settings(base: &Path) -> Settings {
    let mut settings = Settings::with_base_dir(base);
    settings.acquisition.shutter_settle = Duration::ZERO;
    settings.acquisition.shutter_poll_interval = Duration::from_millis(1);
    settings.acquisition.shutter_timeout = Duration::from_millis(200);
    settings.acquisition.device_timeout = Duration::from_secs(2);
    settings
}

fn beamtime(settings: &Settings) -> Beamtime {
    start_beamtime(settings, "Billinge", "300564", &[], Some(0.1812)).unwrap()
}

fn collector() -> (DocumentCallback, Arc<Mutex<Vec<Document>>>) {
    let docs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&docs);
    (
        Box::new(move |doc: &Document| sink.lock().push(doc.clone())),
        docs,
    )
}

fn starts(docs: &Mutex<Vec<Document>>) -> Vec<StartDoc> {
    docs.lock()
        .iter()
        .filter_map(|doc| match doc {
            Document::Start(start) => Some(start.clone()),
            _ => None,
        })
        .collect()
}

fn ct(exposure: f64) -> PlanRef {
    PlanRef::named("ct", metadata_from([("exposure", json!(exposure))]))
}

#[tokio::test]
async fn fresh_cache_takes_a_dark_then_the_light_run() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();
    let (sub, docs) = collector();

    let uids = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default().with_sub(sub), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(uids.len(), 2);
    let starts = starts(&docs);
    assert!(starts[0].is_dark_frame());
    assert_eq!(starts[0].uid, uids[0]);
    assert!(!starts[1].is_dark_frame());
    assert_eq!(starts[1].metadata[DARK_FIELD_UID], json!(uids[0]));
    assert_eq!(starts[1].metadata["sp_type"], json!("ct"));
    assert_eq!(starts[1].metadata["name"], json!("Ni"));
    assert_eq!(starts[1].metadata["analysis_stage"], json!("raw"));

    let cached = xrun.dark_cache().all();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].uid, uids[0]);
    assert_eq!(devices.shutter.state(), ShutterState::Closed);
}

#[tokio::test]
async fn immediate_repeat_reuses_the_dark() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();

    let first = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap();
    let (sub, docs) = collector();
    let second = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default().with_sub(sub), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(second.len(), 1);
    let starts = starts(&docs);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].metadata[DARK_FIELD_UID], json!(first[0]));
    assert_eq!(xrun.dark_cache().len(), 1);
}

#[tokio::test]
async fn different_exposure_needs_a_new_dark() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();

    xrun.invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap();
    let uids = xrun
        .invoke(0usize, ct(0.5), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(uids.len(), 2);
    assert_eq!(xrun.dark_cache().len(), 2);
}

#[tokio::test]
async fn auto_dark_off_leaves_no_dark_key() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();
    let (sub, docs) = collector();

    let uids = xrun
        .invoke(
            0usize,
            ct(0.1),
            InvokeOptions::default().auto_dark(false).with_sub(sub),
            MetadataMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(uids.len(), 1);
    let starts = starts(&docs);
    assert!(!starts[0].metadata.contains_key(DARK_FIELD_UID));
    assert!(xrun.dark_cache().is_empty());
}

#[tokio::test]
async fn scanplan_metadata_is_never_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let bt = beamtime(&settings);
    let sp = bt.scanplan(0).unwrap().clone();
    let sample = bt.sample(0).unwrap().clone();
    let sp_layers = sp.md().snapshot_layers();
    let sample_layers = sample.md().snapshot_layers();
    let sp_file = std::fs::read(sp.path()).unwrap();

    let calib_dir = settings.calibration_dir();
    std::fs::write(calib_dir.join("calib_20261018.yml"), "wavelength: 0.1812\n").unwrap();

    let xrun = CustomizedRunEngine::new(bt, devices.device_set(), settings).unwrap();
    for auto_dark in [true, false] {
        xrun.invoke(
            sample.clone(),
            sp.clone(),
            InvokeOptions::default().auto_dark(auto_dark),
            metadata_from([("operator", json!("tl"))]),
        )
        .await
        .unwrap();
    }

    assert_eq!(sp.md().snapshot_layers(), sp_layers);
    assert_eq!(sample.md().snapshot_layers(), sample_layers);
    assert_eq!(std::fs::read(sp.path()).unwrap(), sp_file);
    assert!(!sp.md().contains_key(DARK_FIELD_UID));
    assert!(!sp.md().contains_key("calibration_md"));
}

#[tokio::test]
async fn calibration_is_attached_to_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let calib_dir = settings.calibration_dir();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();

    std::fs::write(
        calib_dir.join("Ni_calib.yml"),
        "wavelength: 0.1812\ndistance: 0.21\n",
    )
    .unwrap();

    let (sub, docs) = collector();
    xrun.invoke(0usize, ct(0.1), InvokeOptions::default().with_sub(sub), MetadataMap::new())
        .await
        .unwrap();

    for start in starts(&docs) {
        let calibration = &start.metadata["calibration_md"];
        assert_eq!(calibration["file_name"], json!("Ni_calib.yml"));
        assert_eq!(calibration["parameters"]["distance"], json!(0.21));
    }
}

#[tokio::test]
async fn temperature_ramp_brackets_every_point() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    let mut bt = beamtime(&settings);
    let experiment = bt.experiment("default").unwrap().clone();
    let ramp = bt
        .add_scanplan(
            &experiment,
            ScanParams::TemperatureRamp {
                exposure: 0.1,
                start: 300.0,
                stop: 320.0,
                step: 10.0,
            },
        )
        .unwrap();
    let xrun = CustomizedRunEngine::new(bt, devices.device_set(), settings).unwrap();
    let (sub, docs) = collector();

    let uids = xrun
        .invoke(0usize, ramp, InvokeOptions::default().with_sub(sub), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(uids.len(), 2);
    let events: Vec<f64> = docs
        .lock()
        .iter()
        .filter_map(|doc| match doc {
            Document::Event(event) if event.run_uid == uids[1] => {
                event.setpoints.get("temperature").copied()
            }
            _ => None,
        })
        .collect();
    assert_eq!(events, vec![300.0, 310.0, 320.0]);

    let log = devices.log.entries();
    let setpoints: Vec<_> = log.iter().filter(|e| e.starts_with("cs700:")).collect();
    assert_eq!(setpoints, vec!["cs700:300", "cs700:310", "cs700:320"]);
    // Every setpoint change happens with the shutter closed.
    for (i, entry) in log.iter().enumerate() {
        if entry.starts_with("cs700:") {
            let last_shutter = log[..i]
                .iter()
                .rev()
                .find(|e| e.starts_with("shutter:"))
                .map(String::as_str);
            assert_eq!(last_shutter, Some("shutter:closed"), "at {}", entry);
        }
    }
    assert_eq!(devices.shutter.state(), ShutterState::Closed);
}

#[tokio::test]
async fn failed_dark_is_not_cached_and_shutter_ends_closed() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let devices = MockDevices::new();
    devices.detector.fail_triggers(true);
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();

    let err = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap_err();

    assert!(!err.is_validation());
    assert!(xrun.dark_cache().is_empty());
    assert_eq!(devices.shutter.state(), ShutterState::Closed);

    // The next attempt still has to take a dark.
    devices.detector.fail_triggers(false);
    let uids = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap();
    assert_eq!(uids.len(), 2);
}

#[tokio::test]
async fn verify_write_checks_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let run_log_dir = settings.run_log_dir();
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings).unwrap();

    let options = InvokeOptions {
        verify_write: true,
        ..InvokeOptions::default()
    };
    let uids = xrun
        .invoke(0usize, 1usize, options, MetadataMap::new())
        .await
        .unwrap();

    for uid in uids {
        let text = std::fs::read_to_string(run_log_dir.join(format!("{}.jsonl", uid))).unwrap();
        let last: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last["type"], json!("stop"));
        assert_eq!(last["run_uid"], json!(uid));
    }
}

#[tokio::test]
async fn dark_cache_mirror_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.acquisition.dark_cache_mirror = true;

    let uids = {
        let devices = MockDevices::new();
        let xrun = CustomizedRunEngine::new(beamtime(&settings), devices.device_set(), settings.clone())
            .unwrap();
        xrun.invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
            .await
            .unwrap()
    };

    let bt = xpd_acq::beamtime::load_beamtime(&settings.yaml_dir()).unwrap();
    let devices = MockDevices::new();
    let xrun = CustomizedRunEngine::new(bt, devices.device_set(), settings).unwrap();
    assert_eq!(xrun.dark_cache().all()[0].uid, uids[0]);

    let again = xrun
        .invoke(0usize, ct(0.1), InvokeOptions::default(), MetadataMap::new())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
}
