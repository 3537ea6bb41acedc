//! Logging setup for harness-driven tests.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "mesh_harness=info";

/// Install a compact fmt subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test: only the first call installs anything, and
/// output goes through the test writer so it is captured per test.
pub fn init_test_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init();
}
