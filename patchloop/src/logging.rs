//! Diagnostic tracing for the executor process.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operator diagnostics via `RUST_LOG`, output to
//!   stderr. Not persisted, not part of a task's observable history.
//!
//! - **Task events (`io/store`)**: The durable per-task event log that the
//!   CLI and the HTTP stream read. Always written, unaffected by `RUST_LOG`.
//!
//! - **Attempt artifacts (`io/artifacts`)**: Raw model output and applied
//!   diffs under `<data-dir>/artifacts/`, for post-mortems.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter` when unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=patchloop=debug patchloop work --watch
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
