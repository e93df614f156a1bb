//! Shared setup for the integration tests.

use tracing_subscriber::EnvFilter;

/// Route crate logs through the test harness so they show up for failing
/// tests. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("afd_status=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
