//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the level passed
//! in, so operators can raise verbosity without touching configuration.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// Every record carries a timestamp and the emitting thread, which is what
/// makes multi-loop traces readable. Safe to call once per process; later
/// calls are ignored.
pub fn init(default_level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_level)
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_thread_ids(true),
        )
        .try_init();
}
