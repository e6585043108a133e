//! Logging setup for hosts embedding the engine.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::error::{SyncError, SyncResult};

static TEST_INIT: Once = Once::new();

/// Installs a JSON `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init_logging(default_filter: &str) -> SyncResult<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))
            .map_err(|e| SyncError::configuration(format!("invalid log filter: {e}")))?;

    tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| SyncError::internal(format!("failed to install subscriber: {e}")))
}

/// Installs a test-writer subscriber once per process.
pub fn init_test_logging() {
    TEST_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .try_init();
    });
}
