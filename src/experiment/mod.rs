//! Acquisition orchestration (Bluesky-inspired)
//!
//! # Architecture
//!
//! - **Plans** ([`plans`], [`templates`]): pull-based command streams
//! - **Preprocessors** ([`preprocessors`]): plans wrapping plans (shutter
//!   bracketing, dark-frame interleaving, metadata injection)
//! - **RunEngine** ([`run_engine`]): executes commands against devices and
//!   emits documents
//! - **Documents** ([`document`]): Start, Descriptor, Event, Stop
//! - **Dark frames** ([`dark`]): cache of completed dark runs and the
//!   freshness/match rules for reusing them
//! - **Orchestrator** ([`orchestrator`]): `invoke(sample, plan, ...)` bound to a
//!   beamtime
//!
//! # Example
//!
//! ```rust,ignore
//! use xpd_acq::experiment::{CustomizedRunEngine, InvokeOptions, PlanRef};
//!
//! let xrun = CustomizedRunEngine::new(beamtime, devices, settings)?;
//!
//! // Sample 0, scan plan 3; a dark frame is taken first if none is valid
//! let uids = xrun.invoke(0usize, 3usize, InvokeOptions::default(), md).await?;
//! ```

pub mod dark;
pub mod document;
pub mod orchestrator;
pub mod plans;
pub mod preprocessors;
pub mod run_engine;
pub mod templates;

pub use dark::{validate_dark, DarkFrameCache, DarkFrameRecord, DarkPolicy};
pub use document::{DataKey, DescriptorDoc, Document, EventDoc, ExitStatus, StartDoc, StopDoc};
pub use orchestrator::{CustomizedRunEngine, InvokeOptions, PlanRef, SampleRef};
pub use plans::{Plan, PlanCommand};
pub use run_engine::{DocumentCallback, EngineControl, EngineState, ExecuteOptions, RunEngine};
pub use templates::{PlanRegistry, ScanKind, ScanParams};
