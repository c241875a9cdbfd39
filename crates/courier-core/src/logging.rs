//! Tracing subscriber bootstrap for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Initialize an env-filtered fmt subscriber.
///
/// `RUST_LOG` overrides `default_level`. Safe to call more than once;
/// later calls are no-ops.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
