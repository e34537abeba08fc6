//! Optional subscriber setup for shells and test binaries.
//!
//! The library itself only emits `tracing` events. Hosts that already install
//! a subscriber should not call [`init`].

use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "shared=info";

/// Installs a formatting subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns `false` when a global subscriber was already set.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Test-friendly variant writing through the libtest capture.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("shared=debug"))
        .with_test_writer()
        .try_init();
}
