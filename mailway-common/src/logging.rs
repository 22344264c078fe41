//! Subscriber initialization for the daemon.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The configured `verbose` flag selects the default level; `RUST_LOG`
/// always wins when set. Safe to call more than once (later calls are
/// no-ops), which keeps test setup simple.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
