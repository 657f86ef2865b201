//! Tracing subscriber setup.
//!
//! Called once from the startup routine. `RUST_LOG` takes precedence over the
//! configured level so operators can turn on `debug` for a single session.

use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
