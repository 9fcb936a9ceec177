//! Tracing setup for waggle.
//!
//! One init call shared by the hub binary and integration tests. Filtering
//! follows `RUST_LOG` when set; the fallback keeps hub crates at `info` and
//! quiets the HTTP plumbing.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "waggle=info,tower_http=warn,hyper=warn";

/// Install the global subscriber. Call once, early in main.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Best-effort init for tests: ignores the error when a subscriber is
/// already installed by another test in the same process.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}
