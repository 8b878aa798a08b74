//! Process-wide tracing setup shared by binaries and tests.

pub mod tracing;

/// Initialize observability for the process. Safe to call multiple times;
/// subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}
