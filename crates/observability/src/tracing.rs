//! Tracing/logging initialization.
//!
//! Logs are emitted as one JSON object per line. The filter comes from
//! `RUST_LOG` when set, otherwise from the caller's default directive.

use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if it parses, `default_directive` otherwise.
pub fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global JSON subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}
