//! Retention reaper for the commit log.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use regshard_core::{BucketId, Clock, SystemClock};

use super::r#trait::CommitLog;
use crate::backoff::{Backoff, RetryError, Sleeper, ThreadSleeper};
use crate::error::StoreError;

/// Default retention window: 30 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Rows deleted per store call.
pub const DEFAULT_REAP_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Entries committed strictly before this instant were eligible.
    pub watermark: DateTime<Utc>,
    pub deleted: BTreeMap<BucketId, usize>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// Deletes commit-log entries older than the retention window, bucket by bucket.
///
/// Every delete call is bounded by `batch_size` and individually retried, so a run
/// that dies halfway leaves a consistent log and the next run simply continues. An
/// entry aged exactly the retention window is kept.
#[derive(Debug)]
pub struct CommitLogReaper<L, C = SystemClock, S = ThreadSleeper> {
    log: L,
    clock: C,
    retention: Duration,
    batch_size: usize,
    backoff: Backoff<S>,
}

impl<L: CommitLog> CommitLogReaper<L, SystemClock, ThreadSleeper> {
    pub fn new(log: L) -> Self {
        Self::with_parts(log, SystemClock, Backoff::default())
    }
}

impl<L, C, S> CommitLogReaper<L, C, S>
where
    L: CommitLog,
    C: Clock,
    S: Sleeper,
{
    pub fn with_parts(log: L, clock: C, backoff: Backoff<S>) -> Self {
        Self {
            log,
            clock,
            retention: DEFAULT_RETENTION,
            batch_size: DEFAULT_REAP_BATCH_SIZE,
            backoff,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Cut-off for a run starting at `now`.
    pub fn watermark_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Reap every bucket once. The watermark is fixed at the start of the run.
    pub fn run(&self) -> Result<ReapReport, RetryError<StoreError>> {
        let watermark = self.watermark_at(self.clock.now());
        let mut deleted = BTreeMap::new();

        for bucket in self.log.log_buckets().buckets() {
            let count = self.reap_bucket(bucket, watermark)?;
            deleted.insert(bucket, count);
        }

        let report = ReapReport { watermark, deleted };
        info!(
            watermark = %report.watermark,
            deleted = report.total(),
            "commit log reap finished"
        );
        Ok(report)
    }

    fn reap_bucket(&self, bucket: BucketId, watermark: DateTime<Utc>) -> Result<usize, RetryError<StoreError>> {
        let mut total = 0;
        loop {
            let deleted = self.backoff.retry("commit_log.delete_before", |_| {
                self.log.delete_before(bucket, watermark, self.batch_size)
            })?;
            total += deleted;
            if deleted < self.batch_size {
                break;
            }
        }
        if total > 0 {
            debug!(%bucket, deleted = total, "reaped commit log bucket");
        }
        Ok(total)
    }
}
