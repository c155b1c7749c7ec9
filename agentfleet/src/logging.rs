//! Diagnostic tracing for the deployer.
//!
//! - **Tracing (this module)**: stage-level diagnostics via `RUST_LOG`, to stderr.
//! - **Command output (`main`)**: progress and the fleet summary, to stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `agentfleet=info` and `warn` for everything
/// else. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=agentfleet=debug agentfleet deploy_all
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,agentfleet=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
