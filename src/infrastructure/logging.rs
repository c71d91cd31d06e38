//! Logging configuration
//!
//! Initializes tracing for the application.

use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` wins, then `level`, then `info`
#[must_use]
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes logging with the specified level
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(level: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
