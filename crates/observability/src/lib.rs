//! Process-wide observability setup for the settlement services.

/// Initialize tracing for the process with the default filter (`info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing configuration (filters, layers).
pub mod tracing;
