//! Telemetry module providing tracing subscriber initialization.
//!
//! Two entry points:
//! - `init_dev_subscriber()` - stderr logging at DEBUG and above
//! - `init_dev_subscriber_with_env_filter()` - same, but honoring `RUST_LOG`
//!
//! Call one of them once at application startup (not in library code).

use tracing::Level;
use tracing_subscriber::fmt;

/// Initialize a simple stderr subscriber for development.
///
/// This sets up a tracing subscriber that:
/// - Outputs to stderr
/// - Shows DEBUG level and above
/// - Includes target (module path), file, and line number
///
/// # Panics
/// Panics if a global subscriber has already been set.
pub fn init_dev_subscriber() {
    let subscriber = fmt::Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Initialize a stderr subscriber that respects the `RUST_LOG` environment
/// variable for filtering. If `RUST_LOG` is not set, defaults to INFO level.
///
/// # Example
/// ```no_run
/// use weir_core::telemetry;
///
/// fn main() {
///     // RUST_LOG=weir_engine=debug,info for per-crate filtering
///     telemetry::init_dev_subscriber_with_env_filter();
///     tracing::info!("node starting");
/// }
/// ```
pub fn init_dev_subscriber_with_env_filter() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
