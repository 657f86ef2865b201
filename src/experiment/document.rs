//! Run documents.
//!
//! The run engine describes each run as a short stream of documents that
//! subscribers consume as they arrive (live tables, file writers, the
//! write-verification log):
//!
//! ```text
//! start ── descriptor "primary" ── event × N ── stop
//! ```
//!
//! The start document carries the full run metadata: sample, scan plan,
//! beamline fields, the calibration snapshot and, for light runs, the uid of
//! the dark frame to subtract. Timestamps are epoch seconds, the same clock
//! the dark-frame cache uses.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::experiment::dark::now_epoch;
use crate::experiment::plans::DARK_FRAME_KEY;
use crate::metadata::MetadataMap;

fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Any document emitted by the run engine. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Opens a run
    Start(StartDoc),
    /// Describes the event stream
    Descriptor(DescriptorDoc),
    /// One exposure
    Event(EventDoc),
    /// Closes a run
    Stop(StopDoc),
}

impl Document {
    /// Uid of the run the document belongs to.
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(start) => &start.uid,
            Document::Descriptor(desc) => &desc.run_uid,
            Document::Event(event) => &event.run_uid,
            Document::Stop(stop) => &stop.run_uid,
        }
    }

    /// Document kind as it appears in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }

    /// Creation time in epoch seconds.
    pub fn time(&self) -> f64 {
        match self {
            Document::Start(start) => start.time,
            Document::Descriptor(desc) => desc.time,
            Document::Event(event) => event.time,
            Document::Stop(stop) => stop.time,
        }
    }
}

/// Opens a run. Its uid is the run uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Run uid
    pub uid: String,
    /// Epoch seconds
    pub time: f64,
    /// Plan that opened the run
    pub plan_type: String,
    /// Flattened run metadata
    pub metadata: MetadataMap,
}

impl StartDoc {
    /// Start document with a fresh uid, stamped now.
    pub fn new(plan_type: &str, metadata: MetadataMap) -> Self {
        Self {
            uid: new_uid(),
            time: now_epoch(),
            plan_type: plan_type.to_string(),
            metadata,
        }
    }

    /// True when the metadata marks this as a dark-frame run.
    pub fn is_dark_frame(&self) -> bool {
        self.metadata
            .get(DARK_FRAME_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Schema of one reading field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Value type, `number` for every reading
    pub dtype: String,
    /// Device the field comes from
    pub source: String,
    /// Unit of the value
    pub units: String,
}

impl DataKey {
    /// Numeric field read from `source`.
    pub fn number(source: &str, units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            units: units.to_string(),
        }
    }
}

/// Describes the event stream of a run, plus the detector settings it was
/// taken with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Descriptor uid
    pub uid: String,
    /// Uid of the run the stream belongs to
    pub run_uid: String,
    /// Epoch seconds
    pub time: f64,
    /// Stream name, `primary` for every built-in plan
    pub stream: String,
    /// Field name to schema
    pub data_keys: BTreeMap<String, DataKey>,
    /// Detector settings at the time the stream was opened
    pub detector_config: MetadataMap,
}

impl DescriptorDoc {
    /// Descriptor for `stream` in the run `run_uid`.
    pub fn new(run_uid: &str, stream: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            time: now_epoch(),
            stream: stream.to_string(),
            data_keys: BTreeMap::new(),
            detector_config: MetadataMap::new(),
        }
    }

    /// Declare a field of the stream.
    pub fn with_data_key(mut self, field: &str, key: DataKey) -> Self {
        self.data_keys.insert(field.to_string(), key);
        self
    }

    /// Record a detector setting.
    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.detector_config.insert(key.to_string(), value);
        self
    }
}

/// One exposure: the detector reading and the setpoints in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    /// Event uid
    pub uid: String,
    /// Uid of the run
    pub run_uid: String,
    /// Uid of the descriptor the event belongs to
    pub descriptor: String,
    /// 1-based position in the stream
    pub seq_num: u32,
    /// Epoch seconds
    pub time: f64,
    /// Detector reading, field name to value
    pub data: BTreeMap<String, f64>,
    /// Setpoints in effect, axis to value
    #[serde(default)]
    pub setpoints: BTreeMap<String, f64>,
}

impl EventDoc {
    /// Empty event number `seq_num` of the stream `descriptor`.
    pub fn new(run_uid: &str, descriptor: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor: descriptor.to_string(),
            seq_num,
            time: now_epoch(),
            data: BTreeMap::new(),
            setpoints: BTreeMap::new(),
        }
    }

    /// Add reading fields.
    pub fn with_data(mut self, data: impl IntoIterator<Item = (String, f64)>) -> Self {
        self.data.extend(data);
        self
    }

    /// Record the setpoint of `axis`.
    pub fn with_setpoint(mut self, axis: &str, value: f64) -> Self {
        self.setpoints.insert(axis.to_string(), value);
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Plan finished
    Success,
    /// Stopped on request
    Abort,
    /// Stopped by an error
    Fail,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::Abort => "abort",
            ExitStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Closes a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Stop document uid
    pub uid: String,
    /// Uid of the run being closed
    pub run_uid: String,
    /// Epoch seconds
    pub time: f64,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Empty on success
    #[serde(default)]
    pub reason: String,
    /// Events emitted before the stop
    pub num_events: u32,
}

impl StopDoc {
    /// Stop document stamped now.
    pub fn new(run_uid: &str, exit_status: ExitStatus, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            time: now_epoch(),
            exit_status,
            reason: reason.to_string(),
            num_events,
        }
    }

    /// A run that completed.
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Success, "", num_events)
    }

    /// A run stopped on request.
    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Abort, reason, num_events)
    }

    /// A run stopped by an error.
    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Fail, reason, num_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dark_flag_read_from_metadata() {
        let mut md = MetadataMap::new();
        md.insert(DARK_FRAME_KEY.to_string(), json!(true));
        assert!(StartDoc::new("ct", md).is_dark_frame());
        assert!(!StartDoc::new("ct", MetadataMap::new()).is_dark_frame());
    }

    #[test]
    fn test_event_carries_reading_and_setpoint() {
        let reading = [("pe1c_image_sum".to_string(), 42.0)];
        let event = EventDoc::new("run-1", "desc-1", 1)
            .with_data(reading)
            .with_setpoint("temperature", 300.0);

        assert_eq!(event.data["pe1c_image_sum"], 42.0);
        assert_eq!(event.setpoints["temperature"], 300.0);
    }

    #[test]
    fn test_stop_document_json_line() {
        let doc = Document::Stop(StopDoc::fail("run-1", "detector fault", 0));
        let line = serde_json::to_string(&doc).unwrap();

        assert!(line.contains("\"type\":\"stop\""));
        assert!(line.contains("\"exit_status\":\"fail\""));
        let back: Document = serde_json::from_str(&line).unwrap();
        assert_eq!(back.run_uid(), "run-1");
        match back {
            Document::Stop(stop) => assert_eq!(stop.exit_status, ExitStatus::Fail),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_config_values() {
        let desc = DescriptorDoc::new("run-1", "primary")
            .with_data_key("pe1c_image_sum", DataKey::number("pe1c", "counts"))
            .with_config("acquire_time", json!(0.1));

        assert_eq!(desc.detector_config["acquire_time"], json!(0.1));
        assert_eq!(desc.data_keys["pe1c_image_sum"].dtype, "number");
    }
}
