//! Tracing setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    init_with_filter("info");
}

/// Install a fmt subscriber with an explicit default filter, still
/// overridable through `RUST_LOG`.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    // try_init fails when a subscriber is already installed; keep it.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
