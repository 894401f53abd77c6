//! Tracing subscriber setup.
//!
//! Every event is emitted as one JSON object per line. Job runners, reapers and exporters
//! log with structured fields (`job_key`, `bucket`, `lease_id`) so lines can be filtered
//! per bucket or per job without parsing messages.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Resolve the active filter: `RUST_LOG` wins, then `fallback`, then [`DEFAULT_FILTER`].
pub fn filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global JSON subscriber. Later calls leave the first subscriber in place.
pub fn init(fallback: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(fallback))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
