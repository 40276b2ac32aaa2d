//! Development-time tracing for the agent.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics, output to stderr. Not
//!   persisted, not part of the run's product output.
//!
//! - **Run log (`io/run_log`)**: Product artifact in the workspace
//!   (`log.txt`). Always written, unaffected by log levels.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const FALLBACK_LEVEL: &str = "info";

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (the configured `LOG_LEVEL`)
/// is used. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// LOG_LEVEL=debug agent run --workspace ./workspace
/// RUST_LOG=agent::io::provider=trace agent run
/// ```
pub fn init(level: &str) {
    let (directive, unknown) = resolve_level(level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();

    if unknown {
        tracing::warn!(level, fallback = FALLBACK_LEVEL, "unknown log level");
    }
}

/// Map a configured level to a filter directive, flagging unknown values.
fn resolve_level(level: &str) -> (&'static str, bool) {
    let normalized = level.trim().to_ascii_lowercase();
    match LEVELS.iter().find(|known| **known == normalized) {
        Some(known) => (known, false),
        None => (FALLBACK_LEVEL, true),
    }
}
