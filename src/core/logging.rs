//! Process-wide tracing setup.
//!
//! Reads `RUST_LOG`; defaults to `warn`. Output goes to stderr so the JSON
//! envelopes on stdout stay machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Safe to call more than once.
///
/// ```bash
/// RUST_LOG=marshal=debug marshal agent --territory 01J... poll --profile standard
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
