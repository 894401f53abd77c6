//! Bucketed, append-only commit log.
//!
//! Every committed transaction is recorded as one [`CommitLogEntry`] in the bucket its
//! resource hashes to. The log backs point-in-time recovery and incremental export; it
//! is trimmed only by the retention reaper.

pub mod export;
pub mod reaper;
pub mod scan;
pub mod r#trait;

pub use export::{CommitLogDiffExporter, ExportReport, ExportSink, InMemoryWatermarkStore, JsonLinesSink, WatermarkStore};
pub use reaper::{CommitLogReaper, ReapReport};
pub use scan::{CommitLogScan, ScanCursor, SCAN_PAGE_SIZE};
pub use r#trait::{CommitLog, CommitLogEntry, CommitPosition, Mutation, MutationSet, TimeRange};
