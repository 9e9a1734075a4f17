/// Common test utilities and helpers for integration tests
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

pub mod fixtures;

/// Initialize test logging. `RUST_LOG` selects what is shown.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Simulated time `minutes` after the epoch
pub fn minutes(minutes: u64) -> DateTime<Utc> {
    harness::evaluator::simulated_time(Duration::from_secs(minutes * 60))
}
