//! Run engine: executes a plan against the bound devices.
//!
//! The engine pulls one command at a time from a [`Plan`] and performs it,
//! emitting a document stream per run (Start, Descriptor, Event..., Stop) to
//! the per-call subscribers and to every [`RunEngine::subscribe`] receiver.
//!
//! # Guarantees
//!
//! - Every device await is bounded by `device_timeout`; shutter moves poll
//!   the shutter until it reports the requested state, up to `shutter_timeout`.
//! - A dark-frame run is added to the [`DarkFrameCache`] only after its
//!   `CloseRun` succeeded. A failed run gets a `fail` stop document and no
//!   cache entry.
//! - On any error the shutter is driven closed before the error is returned.
//! - Pause and abort requests are honoured at `Checkpoint` commands.
//! - Dropping an `execute` future part-way (a `timeout` or `select!` around
//!   it) stops the open run with `abort`, returns the engine to `Idle` and
//!   spawns a shutter close on the current runtime.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{AcquisitionConfig, Settings};
use crate::error::{AcqError, AppResult};
use crate::experiment::dark::{now_epoch, DarkFrameCache, DarkFrameRecord};
use crate::experiment::document::{DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use crate::experiment::plans::{Plan, PlanCommand};
use crate::hardware::{DeviceSet, Reading, Shutter, ShutterState};
use crate::metadata::MetadataMap;
use serde_json::json;

/// Per-call document subscriber.
pub type DocumentCallback = Box<dyn Fn(&Document) + Send + Sync>;

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Ready for the next plan
    Idle,
    /// Executing a plan
    Running,
    /// Waiting at a checkpoint
    Paused,
    /// Closing the open run after an abort
    Aborting,
}

#[derive(Debug, Clone, PartialEq)]
enum ControlSignal {
    Run,
    Pause,
    Abort(String),
}

/// Cloneable handle for pausing, resuming and aborting a running plan.
///
/// Requests act on the plan that is running. Anything requested while the
/// engine is idle is discarded when the next plan starts.
#[derive(Debug, Clone)]
pub struct EngineControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for EngineControl {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }
}

impl EngineControl {
    /// Pause at the next checkpoint.
    pub fn request_pause(&self) {
        self.tx.send_replace(ControlSignal::Pause);
    }

    /// Continue a paused plan.
    pub fn resume(&self) {
        self.tx.send_replace(ControlSignal::Run);
    }

    /// Abort at the next checkpoint (or immediately, if paused).
    pub fn abort(&self, reason: &str) {
        self.tx.send_replace(ControlSignal::Abort(reason.to_string()));
    }

    /// True while a pause is requested and not yet resumed.
    pub fn is_pause_requested(&self) -> bool {
        *self.tx.borrow() == ControlSignal::Pause
    }

    fn subscribe(&self) -> watch::Receiver<ControlSignal> {
        self.tx.subscribe()
    }
}

/// Options for one [`RunEngine::execute`] call.
#[derive(Default)]
pub struct ExecuteOptions {
    /// Subscribers for this call only
    pub subs: Vec<DocumentCallback>,
    /// Log each run to `<run_log_dir>/<uid>.jsonl` and check it was fully written
    pub verify_write: bool,
    /// Return [`AcqError::Interrupted`] instead of the uids when aborted
    pub raise_if_interrupted: bool,
}

enum Flow {
    Completed,
    Aborted(String),
}

/// Executes plans against one [`DeviceSet`].
pub struct RunEngine {
    devices: DeviceSet,
    cache: DarkFrameCache,
    acquisition: AcquisitionConfig,
    run_log_dir: PathBuf,
    control: EngineControl,
    state: Arc<RwLock<EngineState>>,
    doc_tx: broadcast::Sender<Document>,
}

impl RunEngine {
    /// Engine bound to `devices`, timing taken from `settings`.
    pub fn new(devices: DeviceSet, cache: DarkFrameCache, settings: &Settings) -> Self {
        let (doc_tx, _) = broadcast::channel(1024);
        Self {
            devices,
            cache,
            acquisition: settings.acquisition.clone(),
            run_log_dir: settings.run_log_dir(),
            control: EngineControl::default(),
            state: Arc::new(RwLock::new(EngineState::Idle)),
            doc_tx,
        }
    }

    /// Cloneable pause and abort handle.
    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Receive every document emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_tx.subscribe()
    }

    /// Devices the engine drives.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Dark frames this engine records into.
    pub fn cache(&self) -> &DarkFrameCache {
        &self.cache
    }

    /// Run `plan` to completion. `run_md` is merged under every run's own metadata.
    ///
    /// Returns the uid of every run opened, in order.
    pub async fn execute(
        &self,
        plan: Box<dyn Plan>,
        run_md: &MetadataMap,
        options: ExecuteOptions,
    ) -> AppResult<Vec<String>> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Idle {
                return Err(AcqError::Configuration(
                    "run engine is already executing a plan".to_string(),
                ));
            }
            *state = EngineState::Running;
        }
        self.control.resume();

        let mut exec = Execution {
            engine: self,
            run_md,
            subs: &options.subs,
            verify_write: options.verify_write,
            run: None,
            groups: HashMap::new(),
            temperature: None,
            uids: Vec::new(),
            finished: false,
        };

        let result = match exec.run(plan).await {
            Ok(Flow::Completed) => Ok(std::mem::take(&mut exec.uids)),
            Ok(Flow::Aborted(reason)) => {
                *self.state.write() = EngineState::Aborting;
                warn!(reason = %reason, "plan aborted");
                exec.stop_open_run(StopDoc::abort, &reason);
                exec.cancel_triggers();
                self.force_shutter_closed().await;
                self.control.resume();
                if options.raise_if_interrupted {
                    Err(AcqError::Interrupted(reason))
                } else {
                    Ok(std::mem::take(&mut exec.uids))
                }
            }
            Err(e) => {
                warn!(error = %e, "plan failed");
                exec.stop_open_run(StopDoc::fail, &e.to_string());
                exec.cancel_triggers();
                self.force_shutter_closed().await;
                Err(e)
            }
        };

        exec.finished = true;
        *self.state.write() = EngineState::Idle;
        result
    }

    /// Await a device future, bounded by `device_timeout`.
    async fn bounded<T, F>(&self, device: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        with_timeout(self.acquisition.device_timeout, device, fut).await
    }

    async fn move_shutter(&self, target: ShutterState) -> AppResult<()> {
        drive_shutter(self.devices.shutter.as_ref(), target, &self.acquisition).await
    }

    /// Close the shutter from a detached task; used when `execute` is dropped.
    fn spawn_shutter_close(&self) {
        if !self.acquisition.shutter_control {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime left to close the shutter on");
            return;
        };
        let shutter = Arc::clone(&self.devices.shutter);
        let acquisition = self.acquisition.clone();
        runtime.spawn(async move {
            if let Err(e) = drive_shutter(shutter.as_ref(), ShutterState::Closed, &acquisition).await
            {
                warn!(error = %e, "could not confirm the shutter closed");
            }
        });
    }

    async fn force_shutter_closed(&self) {
        if !self.acquisition.shutter_control {
            return;
        }
        warn!("closing shutter after interrupted plan");
        if let Err(e) = self.move_shutter(ShutterState::Closed).await {
            warn!(error = %e, "could not confirm the shutter closed");
        }
    }

    async fn await_trigger(&self, handle: JoinHandle<anyhow::Result<()>>) -> AppResult<()> {
        let name = self.devices.detector.name().to_string();
        let abort = handle.abort_handle();
        let limit = self.acquisition.device_timeout;
        match timeout(limit, handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(AcqError::from_device(&name, e)),
            Ok(Err(join)) => Err(AcqError::DeviceFault {
                device: name,
                reason: join.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Err(AcqError::DeviceTimeout {
                    device: name,
                    waited: limit,
                })
            }
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, device: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AcqError::from_device(device, e)),
        Err(_) => Err(AcqError::DeviceTimeout {
            device: device.to_string(),
            waited: limit,
        }),
    }
}

/// Command the shutter, then poll until it reports `target`.
async fn drive_shutter(
    shutter: &dyn Shutter,
    target: ShutterState,
    acquisition: &AcquisitionConfig,
) -> AppResult<()> {
    let name = shutter.name();
    let device_timeout = acquisition.device_timeout;
    with_timeout(device_timeout, name, shutter.set(target)).await?;

    let started = Instant::now();
    let limit = acquisition.shutter_timeout;
    loop {
        if with_timeout(device_timeout, name, shutter.get()).await? == target {
            debug!(shutter = %name, state = %target, "shutter in position");
            return Ok(());
        }
        if started.elapsed() >= limit {
            return Err(AcqError::DeviceTimeout {
                device: name.to_string(),
                waited: limit,
            });
        }
        sleep(acquisition.shutter_poll_interval).await;
    }
}

/// JSON-lines log of one run's documents.
struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    fn create(dir: &Path, uid: &str) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", uid));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    fn append(&mut self, doc: &Document) -> AppResult<()> {
        let line = serde_json::to_string(doc)
            .map_err(|e| AcqError::Persistence(format!("cannot encode document: {}", e)))?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    /// The log must end with this run's stop document.
    fn verify(&self, stop: &StopDoc) -> AppResult<()> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            AcqError::Persistence(format!("run log {} unreadable: {}", self.path.display(), e))
        })?;
        let last = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| {
                AcqError::Persistence(format!("run log {} is empty", self.path.display()))
            })?;
        match serde_json::from_str::<Document>(last) {
            Ok(Document::Stop(written))
                if written.uid == stop.uid && written.exit_status == stop.exit_status =>
            {
                Ok(())
            }
            _ => Err(AcqError::Persistence(format!(
                "run {} was not completely written to {}",
                stop.run_uid,
                self.path.display()
            ))),
        }
    }
}

struct OpenRunState {
    uid: String,
    dark: bool,
    descriptor_uid: Option<String>,
    num_events: u32,
    reading: Reading,
    log: Option<RunLog>,
}

fn publish(
    engine: &RunEngine,
    subs: &[DocumentCallback],
    log: Option<&mut RunLog>,
    doc: Document,
) -> AppResult<()> {
    if let Some(log) = log {
        log.append(&doc)?;
    }
    for sub in subs {
        sub(&doc);
    }
    // No receivers is fine.
    let _ = engine.doc_tx.send(doc);
    Ok(())
}

/// State of one `execute` call.
struct Execution<'a> {
    engine: &'a RunEngine,
    run_md: &'a MetadataMap,
    subs: &'a [DocumentCallback],
    verify_write: bool,
    run: Option<OpenRunState>,
    groups: HashMap<String, Vec<JoinHandle<anyhow::Result<()>>>>,
    temperature: Option<f64>,
    uids: Vec<String>,
    /// Set once `execute` has cleaned up on its own
    finished: bool,
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("plan execution dropped before completion");
        self.stop_open_run(StopDoc::abort, "execution cancelled");
        self.cancel_triggers();
        self.engine.spawn_shutter_close();
        *self.engine.state.write() = EngineState::Idle;
    }
}

impl Execution<'_> {
    async fn run(&mut self, mut plan: Box<dyn Plan>) -> AppResult<Flow> {
        let plan_type = plan.plan_type().to_string();
        while let Some(cmd) = plan.next_command() {
            debug!(command = ?cmd, "dispatch");
            if cmd == PlanCommand::Checkpoint {
                if let Some(reason) = self.checkpoint().await {
                    return Ok(Flow::Aborted(reason));
                }
                continue;
            }
            self.dispatch(cmd, &plan_type).await?;
        }

        if let Some(run) = &self.run {
            return Err(AcqError::Configuration(format!(
                "plan '{}' ended with run {} still open",
                plan_type, run.uid
            )));
        }
        Ok(Flow::Completed)
    }

    async fn checkpoint(&self) -> Option<String> {
        let mut rx = self.engine.control.subscribe();
        loop {
            let signal = rx.borrow_and_update().clone();
            match signal {
                ControlSignal::Run => {
                    *self.engine.state.write() = EngineState::Running;
                    return None;
                }
                ControlSignal::Abort(reason) => return Some(reason),
                ControlSignal::Pause => {
                    if self.engine.state() != EngineState::Paused {
                        info!("paused at checkpoint");
                        *self.engine.state.write() = EngineState::Paused;
                    }
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn dispatch(&mut self, cmd: PlanCommand, plan_type: &str) -> AppResult<()> {
        let engine = self.engine;
        let devices = &engine.devices;
        let detector = devices.detector.name();

        match cmd {
            PlanCommand::OpenRun { metadata } => self.open_run(metadata, plan_type)?,
            PlanCommand::CloseRun => self.close_run()?,
            PlanCommand::Stage => engine.bounded(detector, devices.detector.stage()).await?,
            PlanCommand::Unstage => engine.bounded(detector, devices.detector.unstage()).await?,
            PlanCommand::Configure {
                acquire_time,
                frame_count,
            } => {
                engine
                    .bounded(detector, devices.detector.set_acquire_time(acquire_time))
                    .await?;
                engine
                    .bounded(detector, devices.detector.set_frame_count(frame_count))
                    .await?;
                debug!(acquire_time, frame_count, "detector configured");
            }
            PlanCommand::SetShutter(state) => {
                if engine.acquisition.shutter_control {
                    engine.move_shutter(state).await?;
                } else {
                    debug!(state = %state, "shutter control disabled, skipping");
                }
            }
            PlanCommand::SetTemperature(value) => {
                let controller = &devices.temp_controller;
                engine.bounded(controller.name(), controller.set(value)).await?;
                self.temperature = Some(value);
            }
            PlanCommand::Trigger { group } => {
                let detector = Arc::clone(&devices.detector);
                let handle = tokio::spawn(async move { detector.trigger().await });
                self.groups.entry(group).or_default().push(handle);
            }
            PlanCommand::Wait { group } => {
                for handle in self.groups.remove(&group).unwrap_or_default() {
                    engine.await_trigger(handle).await?;
                }
            }
            PlanCommand::Read => {
                let reading = engine.bounded(detector, devices.detector.read()).await?;
                self.open_run_mut("Read")?.reading.extend(reading);
            }
            PlanCommand::Save => self.save()?,
            PlanCommand::Sleep(duration) => sleep(duration).await,
            PlanCommand::Checkpoint => {}
        }
        Ok(())
    }

    fn open_run_mut(&mut self, command: &str) -> AppResult<&mut OpenRunState> {
        self.run
            .as_mut()
            .ok_or_else(|| AcqError::Configuration(format!("{} outside of an open run", command)))
    }

    fn open_run(&mut self, metadata: MetadataMap, plan_type: &str) -> AppResult<()> {
        if let Some(run) = &self.run {
            return Err(AcqError::Configuration(format!(
                "OpenRun while run {} is still open",
                run.uid
            )));
        }

        let mut md = self.run_md.clone();
        md.extend(metadata);
        let start = StartDoc::new(plan_type, md);
        let uid = start.uid.clone();
        let dark = start.is_dark_frame();
        let log = if self.verify_write {
            Some(RunLog::create(&self.engine.run_log_dir, &uid)?)
        } else {
            None
        };

        info!(uid = %uid, dark, "run opened");
        self.uids.push(uid.clone());
        let run = self.run.insert(OpenRunState {
            uid,
            dark,
            descriptor_uid: None,
            num_events: 0,
            reading: Reading::new(),
            log,
        });
        publish(self.engine, self.subs, run.log.as_mut(), Document::Start(start))
    }

    fn save(&mut self) -> AppResult<()> {
        let engine = self.engine;
        let temperature = self.temperature;
        let subs = self.subs;
        let run = self.open_run_mut("Save")?;
        let reading = std::mem::take(&mut run.reading);

        let descriptor_uid = match &run.descriptor_uid {
            Some(uid) => uid.clone(),
            None => {
                let detector = &engine.devices.detector;
                let mut desc = DescriptorDoc::new(&run.uid, "primary")
                    .with_config("acquire_time", json!(detector.acquire_time()))
                    .with_config("frame_count", json!(detector.frame_count()));
                for key in reading.keys() {
                    desc = desc.with_data_key(key, DataKey::number(detector.name(), "counts"));
                }
                let uid = desc.uid.clone();
                run.descriptor_uid = Some(uid.clone());
                publish(engine, subs, run.log.as_mut(), Document::Descriptor(desc))?;
                uid
            }
        };

        run.num_events += 1;
        let mut event = EventDoc::new(&run.uid, &descriptor_uid, run.num_events).with_data(reading);
        if let Some(t) = temperature {
            event = event.with_setpoint("temperature", t);
        }
        publish(engine, subs, run.log.as_mut(), Document::Event(event))
    }

    fn close_run(&mut self) -> AppResult<()> {
        let engine = self.engine;
        let subs = self.subs;
        let run = self.open_run_mut("CloseRun")?;
        let stop = StopDoc::success(&run.uid, run.num_events);
        publish(engine, subs, run.log.as_mut(), Document::Stop(stop.clone()))?;

        let Some(run) = self.run.take() else {
            return Ok(());
        };
        if let Some(log) = &run.log {
            log.verify(&stop)?;
            debug!(path = %log.path.display(), "run log verified");
        }
        info!(uid = %run.uid, events = run.num_events, "run closed");

        if run.dark {
            let detector = &engine.devices.detector;
            let record = DarkFrameRecord::new(
                &run.uid,
                detector.exposure(),
                detector.acquire_time(),
                now_epoch(),
            );
            info!(uid = %record.uid, exposure = record.exposure, "dark frame recorded");
            engine.cache.record(record);
        }
        Ok(())
    }

    /// Stop the open run, if any, with an abort or fail document.
    fn stop_open_run(&mut self, make: fn(&str, &str, u32) -> StopDoc, reason: &str) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let stop = make(&run.uid, reason, run.num_events);
        if let Err(e) = publish(self.engine, self.subs, run.log.as_mut(), Document::Stop(stop)) {
            warn!(uid = %run.uid, error = %e, "failed to write stop document");
        }
    }

    fn cancel_triggers(&mut self) {
        for (_, handles) in self.groups.drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

/// Settings with timings small enough for tests.
#[cfg(test)]
pub(crate) fn fast_settings(base: &Path) -> Settings {
    use std::time::Duration;

    let mut settings = Settings::with_base_dir(base);
    settings.acquisition.shutter_settle = Duration::ZERO;
    settings.acquisition.shutter_poll_interval = Duration::from_millis(1);
    settings.acquisition.shutter_timeout = Duration::from_millis(100);
    settings.acquisition.device_timeout = Duration::from_secs(2);
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::document::ExitStatus;
    use crate::experiment::preprocessors::{dark_subplan, ShutterBracket};
    use crate::experiment::templates::count;
    use crate::hardware::mock::MockDevices;
    use crate::hardware::AreaDetector;
    use parking_lot::Mutex;
    use std::time::Duration;

    const ACQ: f64 = 0.1;

    fn engine(devices: &MockDevices, base: &Path) -> RunEngine {
        RunEngine::new(devices.device_set(), DarkFrameCache::new(), &fast_settings(base))
    }

    fn collector() -> (DocumentCallback, Arc<Mutex<Vec<Document>>>) {
        let docs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&docs);
        (Box::new(move |doc: &Document| sink.lock().push(doc.clone())), docs)
    }

    fn dark_plan() -> Box<dyn Plan> {
        Box::new(crate::experiment::plans::CommandList::new(
            "dark",
            dark_subplan(Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn test_count_emits_document_stream() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = engine(&devices, dir.path());
        let (sub, docs) = collector();

        let mut md = MetadataMap::new();
        md.insert("sample_name".into(), json!("Ni"));
        let uids = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &md,
                ExecuteOptions {
                    subs: vec![sub],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(uids.len(), 1);
        let docs = docs.lock();
        let names: Vec<_> = docs.iter().map(Document::name).collect();
        assert_eq!(names, vec!["start", "descriptor", "event", "stop"]);
        match &docs[0] {
            Document::Start(start) => {
                assert_eq!(start.uid, uids[0]);
                assert_eq!(start.metadata["sample_name"], json!("Ni"));
                assert_eq!(start.metadata["sp_type"], json!("ct"));
            }
            other => panic!("expected start, got {:?}", other),
        }
        assert_eq!(devices.detector.frame_count(), 5);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_dark_run_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        devices.detector.set_acquire_time(ACQ).await.unwrap();
        devices.detector.set_frame_count(5).await.unwrap();
        let engine = engine(&devices, dir.path());

        let uids = engine
            .execute(dark_plan(), &MetadataMap::new(), ExecuteOptions::default())
            .await
            .unwrap();

        let records = engine.cache().all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uid, uids[0]);
        assert!((records[0].exposure - 0.5).abs() < 1e-12);
        assert_eq!(records[0].acquire_time, ACQ);
    }

    #[tokio::test]
    async fn test_failed_dark_is_not_recorded_and_shutter_closes() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        devices.detector.fail_triggers(true);
        let engine = engine(&devices, dir.path());
        let (sub, docs) = collector();

        let plan = Box::new(ShutterBracket::new(dark_plan()));
        let err = engine
            .execute(
                plan,
                &MetadataMap::new(),
                ExecuteOptions {
                    subs: vec![sub],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AcqError::DeviceFault { .. }));
        assert!(engine.cache().is_empty());
        assert_eq!(devices.shutter.state(), ShutterState::Closed);
        let last = docs.lock().last().cloned();
        match last {
            Some(Document::Stop(stop)) => assert_eq!(stop.exit_status, ExitStatus::Fail),
            other => panic!("expected fail stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stuck_shutter_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        devices.shutter.set_stuck(true);
        let engine = engine(&devices, dir.path());

        let plan = Box::new(ShutterBracket::new(Box::new(count(ACQ, 0.5).unwrap())));
        let err = engine
            .execute(plan, &MetadataMap::new(), ExecuteOptions::default())
            .await
            .unwrap_err();

        match err {
            AcqError::DeviceTimeout { device, .. } => assert_eq!(device, "shutter"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(devices.detector.trigger_count(), 0);
    }

    #[tokio::test]
    async fn test_shutter_control_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let mut settings = fast_settings(dir.path());
        settings.acquisition.shutter_control = false;
        let engine = RunEngine::new(devices.device_set(), DarkFrameCache::new(), &settings);

        let plan = Box::new(ShutterBracket::new(Box::new(count(ACQ, 0.5).unwrap())));
        engine
            .execute(plan, &MetadataMap::new(), ExecuteOptions::default())
            .await
            .unwrap();

        assert!(!devices
            .log
            .entries()
            .iter()
            .any(|entry| entry.starts_with("shutter:")));
    }

    /// Subscriber that runs `action` when a run opens.
    fn on_start(action: impl Fn() + Send + Sync + 'static) -> DocumentCallback {
        Box::new(move |doc: &Document| {
            if let Document::Start(_) = doc {
                action();
            }
        })
    }

    #[tokio::test]
    async fn test_abort_at_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = engine(&devices, dir.path());
        let (sub, docs) = collector();
        let control = engine.control();

        let uids = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions {
                    subs: vec![on_start(move || control.abort("operator stop")), sub],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(uids.len(), 1);
        assert_eq!(devices.detector.trigger_count(), 0);
        let last = docs.lock().last().cloned();
        match last {
            Some(Document::Stop(stop)) => {
                assert_eq!(stop.exit_status, ExitStatus::Abort);
                assert_eq!(stop.reason, "operator stop");
            }
            other => panic!("expected abort stop, got {:?}", other),
        }

        let control = engine.control();
        let err = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions {
                    subs: vec![on_start(move || control.abort("again"))],
                    raise_if_interrupted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::Interrupted(_)));
    }

    #[tokio::test]
    async fn test_requests_made_while_idle_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = engine(&devices, dir.path());

        engine.control().abort("stale");
        let uids = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions {
                    raise_if_interrupted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(uids.len(), 1);
        assert_eq!(devices.detector.trigger_count(), 1);

        engine.control().request_pause();
        engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(devices.detector.trigger_count(), 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = Arc::new(engine(&devices, dir.path()));
        let control = engine.control();
        let pauser = engine.control();

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move {
            runner
                .execute(
                    Box::new(count(ACQ, 0.5).unwrap()),
                    &MetadataMap::new(),
                    ExecuteOptions {
                        subs: vec![on_start(move || pauser.request_pause())],
                        ..Default::default()
                    },
                )
                .await
        });

        let mut waited = 0;
        while engine.state() != EngineState::Paused && waited < 100 {
            sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(engine.state(), EngineState::Paused);
        assert!(control.is_pause_requested());
        assert_eq!(devices.detector.trigger_count(), 0);

        control.resume();
        let uids = task.await.unwrap().unwrap();
        assert_eq!(uids.len(), 1);
        assert_eq!(devices.detector.trigger_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_execution_resets_engine_and_closes_shutter() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = engine(&devices, dir.path());
        let (sub, docs) = collector();

        let slow = crate::experiment::plans::CommandList::new(
            "slow",
            vec![
                PlanCommand::open_run(MetadataMap::new()),
                PlanCommand::Sleep(Duration::from_secs(30)),
                PlanCommand::CloseRun,
            ],
        );
        let outcome = timeout(
            Duration::from_millis(100),
            engine.execute(
                Box::new(ShutterBracket::new(Box::new(slow))),
                &MetadataMap::new(),
                ExecuteOptions {
                    subs: vec![sub],
                    ..Default::default()
                },
            ),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(engine.state(), EngineState::Idle);

        let last = docs.lock().last().cloned();
        match last {
            Some(Document::Stop(stop)) => assert_eq!(stop.exit_status, ExitStatus::Abort),
            other => panic!("expected abort stop, got {:?}", other),
        }

        let mut waited = 0;
        while devices.shutter.state() != ShutterState::Closed && waited < 100 {
            sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(devices.shutter.state(), ShutterState::Closed);
        let log = devices.log.entries();
        assert_eq!(log.first().map(String::as_str), Some("shutter:open"));
        assert_eq!(log.last().map(String::as_str), Some("shutter:closed"));

        let uids = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(uids.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_write_logs_documents() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let settings = fast_settings(dir.path());
        let engine = RunEngine::new(devices.device_set(), DarkFrameCache::new(), &settings);

        let uids = engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions {
                    verify_write: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let path = settings.run_log_dir().join(format!("{}.jsonl", uids[0]));
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().last().unwrap().contains("\"type\":\"stop\""));
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_documents() {
        let dir = tempfile::tempdir().unwrap();
        let devices = MockDevices::new();
        let engine = engine(&devices, dir.path());
        let mut rx = engine.subscribe();

        engine
            .execute(
                Box::new(count(ACQ, 0.5).unwrap()),
                &MetadataMap::new(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "start");
    }
}
