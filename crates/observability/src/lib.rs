//! Tracing/logging setup shared by every orchestrator process.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, job_span};
