//! Process-wide tracing setup shared by the binaries.

/// Install the global subscriber.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Filters and output format.
pub mod tracing;
