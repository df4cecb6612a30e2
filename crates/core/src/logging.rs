//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,forge_renderer=debug,forge_rhi=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Thread ids on every line, so records emitted by recording workers
///   can be told apart from the control thread
///
/// Panics if a global subscriber is already installed.
///
/// # Example
/// ```
/// forge_core::init_logging();
/// tracing::info!("Renderer initialized");
/// ```
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Like [`init_logging`], but silently keeps an already installed subscriber.
///
/// Meant for tests, where several tests race to set up logging.
pub fn try_init_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_test_writer(),
        )
        .try_init();
}
