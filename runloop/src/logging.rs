//! Development-time tracing for debugging runloop.
//!
//! Tracing is diagnostics only: enabled through `RUST_LOG`, written to stderr,
//! never persisted. Loop progress and summaries are printed by the CLI to
//! stdout, and the session history lives in `.runloop/state/sessions.json`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=runloop=debug runloop run build --max-iterations 3
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
