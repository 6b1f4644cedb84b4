//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,tandem_renderer=debug,tandem_rhi=info";

/// Initialize the logging system with tracing.
///
/// Filtering comes from `RUST_LOG` when present, otherwise from a default that
/// keeps frame pipeline decisions visible at debug level.
///
/// # Example
/// ```
/// tandem_core::init_logging();
/// tracing::info!("Frame pipeline ready");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
