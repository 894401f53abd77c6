//! Structured logging shared by the regshard binaries and tests.

/// Initialize process-wide JSON logging.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Initialize logging with an explicit fallback filter, used when `RUST_LOG` is unset.
pub fn init_with_default(filter: &str) {
    tracing::init(filter);
}

/// Subscriber setup (filters, JSON layer).
pub mod tracing;
