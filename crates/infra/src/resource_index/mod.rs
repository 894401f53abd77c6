//! Bucketed resource index.
//!
//! One row per live registry resource, spread across buckets so that a registry-wide
//! enumeration becomes `bucket_count` independent, strongly consistent scans.

pub mod async_delete;
pub mod fan_out;
pub mod r#trait;

pub use async_delete::{AsyncDeleteDelay, PendingDelete, PendingDeleteQueue, referencing_resources};
pub use fan_out::{BucketFanOut, BucketOutcome, FanOutError, FanOutReport, FanOutSummary};
pub use r#trait::{INDEX_PAGE_SIZE, IndexScan, ResourceIndex, ResourceIndexEntry};
