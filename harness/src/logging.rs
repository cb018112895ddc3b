//! Diagnostic tracing for the harness binaries.
//!
//! Tracing is for operators debugging policy and approval flow. It is not
//! the audit trail: the ledger and session transcripts are the durable
//! record, and neither depends on `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter` (`warn` for the CLI).
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug harness evaluate project tool_write
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
