//! Device abstraction layer.
//!
//! Acquisition code talks to devices only through the capability traits in
//! [`capabilities`]. Simulated devices live in [`mock`].

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AreaDetector, DeviceSet, Reading, Shutter, ShutterState, TemperatureController,
};
