//! Structured logging initialization.
//!
//! Console output via tracing-subscriber, filtered by `RUST_LOG` with an
//! `info` default. Spans from `#[instrument]` on repositories and pipeline
//! stages carry the table/job context through every log line.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize tracing for the process. Safe to call once; later calls fail
/// quietly (useful in tests that race on initialization).
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
