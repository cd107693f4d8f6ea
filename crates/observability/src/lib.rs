//! Process-wide logging setup shared by the geotill binaries.

/// Initialize tracing with the format named by `GEOTILL_LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
