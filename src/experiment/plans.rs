//! Plan system for declarative acquisition sequences
//!
//! Plans are pull-based generators that yield commands for the run engine to
//! execute. A plan never touches a device itself; it describes what should
//! happen and the engine performs it, one command at a time.
//!
//! # Plan Commands
//!
//! - `OpenRun` / `CloseRun` - Bracket one run (one Start ... Stop document stream)
//! - `Stage` / `Unstage` - Arm and disarm the detector
//! - `Configure` - Set per-frame acquire time and frame count
//! - `SetShutter` / `SetTemperature` - Drive the shutter or temperature controller
//! - `Trigger` / `Wait` - Start an exposure in a group, then wait for the group
//! - `Read` / `Save` - Collect the detector reading and emit it as an event
//! - `Sleep` - Pause for a fixed duration
//! - `Checkpoint` - Safe point for pause/resume/abort
//!
//! Transforms such as shutter bracketing or dark-frame interleaving are plans
//! themselves, wrapping a `Box<dyn Plan>` and rewriting the stream it yields.
//!
//! # Example
//!
//! ```text
//! Configure { acquire_time: 0.1, frame_count: 5 }
//! OpenRun { sp_type: "ct", ... }
//! Checkpoint
//! Trigger { group: "exposure-0" }
//! Wait { group: "exposure-0" }
//! Read
//! Save
//! CloseRun
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use crate::hardware::ShutterState;
use crate::metadata::MetadataMap;

/// Metadata key marking a run taken with the shutter closed.
pub const DARK_FRAME_KEY: &str = "dark_frame";

/// Commands that plans yield for the run engine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Open a new run with run-specific metadata
    OpenRun {
        /// Metadata recorded in the start document
        metadata: MetadataMap,
    },
    /// Close the currently open run
    CloseRun,
    /// Arm the detector
    Stage,
    /// Disarm the detector
    Unstage,
    /// Configure the detector framing
    Configure {
        /// Per-frame acquire time in seconds
        acquire_time: f64,
        /// Frames summed per exposure
        frame_count: u32,
    },
    /// Move the shutter and wait until it arrives
    SetShutter(ShutterState),
    /// Drive the temperature controller to a setpoint
    SetTemperature(f64),
    /// Start an exposure, tracked under `group`
    Trigger {
        /// Completion group name
        group: String,
    },
    /// Block until every trigger in `group` has completed
    Wait {
        /// Completion group name
        group: String,
    },
    /// Read the detector into the pending event
    Read,
    /// Emit the pending event
    Save,
    /// Sleep for a fixed duration
    Sleep(Duration),
    /// Safe point for pause/resume/abort
    Checkpoint,
}

impl PlanCommand {
    /// Open a run with `metadata`.
    pub fn open_run(metadata: MetadataMap) -> Self {
        PlanCommand::OpenRun { metadata }
    }

    /// Trigger the detector as part of `group`.
    pub fn trigger(group: &str) -> Self {
        PlanCommand::Trigger {
            group: group.to_string(),
        }
    }

    /// Wait for every trigger in `group`.
    pub fn wait(group: &str) -> Self {
        PlanCommand::Wait {
            group: group.to_string(),
        }
    }

    /// True for an `OpenRun` that starts a dark-frame run
    pub fn is_dark_open_run(&self) -> bool {
        match self {
            PlanCommand::OpenRun { metadata } => metadata
                .get(DARK_FRAME_KEY)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// True for an `OpenRun` that starts a light (non-dark) run
    pub fn is_light_open_run(&self) -> bool {
        matches!(self, PlanCommand::OpenRun { .. }) && !self.is_dark_open_run()
    }
}

/// Plan trait - all plans and plan transforms implement this
pub trait Plan: Send {
    /// Plan type identifier (e.g., "ct", "Tramp", "shutter_bracket")
    fn plan_type(&self) -> &str;

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;
}

/// A fixed, pre-built sequence of commands
#[derive(Debug, Clone)]
pub struct CommandList {
    plan_type: String,
    commands: VecDeque<PlanCommand>,
}

impl CommandList {
    /// Plan that yields `commands` in order.
    pub fn new(plan_type: &str, commands: impl IntoIterator<Item = PlanCommand>) -> Self {
        Self {
            plan_type: plan_type.to_string(),
            commands: commands.into_iter().collect(),
        }
    }

    /// Commands still to be yielded.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when every command has been yielded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Plan for CommandList {
    fn plan_type(&self) -> &str {
        &self.plan_type
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        self.commands.pop_front()
    }
}

/// Plans run back to back
pub struct Chain {
    plan_type: String,
    plans: VecDeque<Box<dyn Plan>>,
}

impl Plan for Chain {
    fn plan_type(&self) -> &str {
        &self.plan_type
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        while let Some(current) = self.plans.front_mut() {
            if let Some(cmd) = current.next_command() {
                return Some(cmd);
            }
            self.plans.pop_front();
        }
        None
    }
}

/// Run `plans` one after the other as a single plan.
pub fn chain(plan_type: &str, plans: Vec<Box<dyn Plan>>) -> Chain {
    Chain {
        plan_type: plan_type.to_string(),
        plans: plans.into(),
    }
}

/// Drain a plan into a vector. Only meaningful for finite plans.
pub fn collect_commands(plan: &mut dyn Plan) -> Vec<PlanCommand> {
    std::iter::from_fn(|| plan.next_command()).collect()
}

/// Dry-run rendering of a plan: run banners, setpoints and reads.
pub fn summarize(plan: &mut dyn Plan) -> String {
    let mut output = Vec::new();
    let mut read_cache: Vec<&str> = Vec::new();

    while let Some(cmd) = plan.next_command() {
        match cmd {
            PlanCommand::OpenRun { .. } => output.push(format!("{:=^80}", " Open Run ")),
            PlanCommand::CloseRun => output.push(format!("{:=^80}", " Close Run ")),
            PlanCommand::Configure {
                acquire_time,
                frame_count,
            } => output.push(format!(
                "detector -> {} frames x {} s",
                frame_count, acquire_time
            )),
            PlanCommand::SetShutter(state) => output.push(format!("shutter -> {}", state)),
            PlanCommand::SetTemperature(value) => {
                output.push(format!("temperature -> {}", value))
            }
            PlanCommand::Read => read_cache.push("detector"),
            PlanCommand::Save => {
                output.push(format!("  Read {:?}", read_cache));
                read_cache.clear();
            }
            _ => {}
        }
    }
    output.join("\n")
}
