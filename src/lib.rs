//! Core library for the xpd_acq application.
//!
//! Beamline acquisition orchestration for X-ray powder diffraction: scan
//! templates, automatic dark-frame scheduling, per-run metadata injection and
//! a run engine driving an area detector, a beam shutter and a temperature
//! controller. It is used by the `xpd_acq` command-line application.

pub mod beamtime;
pub mod calibration;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod metadata;
