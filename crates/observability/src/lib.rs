//! Tracing and logging (shared setup).

pub use crate::tracing::LogFormat;

/// Initialize process-wide tracing in the given output format.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    crate::tracing::init(format);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
