//! One worker thread per bucket.
//!
//! Registry-wide batch work (index enumeration, commit-log export) runs as independent
//! per-bucket units. Each unit gets its own named thread; a failing or panicking bucket
//! is reported next to the others instead of hiding their results.

use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use regshard_core::BucketId;

use crate::bucket::BucketCount;
use crate::commit_log::{CommitLog, CommitLogEntry, CommitLogScan, ScanCursor, TimeRange};
use crate::resource_index::{IndexScan, ResourceIndex, ResourceIndexEntry};

/// Why one bucket's unit of work did not produce a result.
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("failed to spawn worker for bucket {bucket}: {source}")]
    Spawn {
        bucket: BucketId,
        #[source]
        source: std::io::Error,
    },

    #[error("worker for bucket {bucket} panicked")]
    Panicked { bucket: BucketId },

    #[error("bucket {bucket} failed: {source}")]
    Failed {
        bucket: BucketId,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of one bucket's unit of work.
#[derive(Debug)]
pub struct BucketOutcome<T> {
    pub bucket: BucketId,
    pub result: Result<T, FanOutError>,
}

/// Per-bucket results, ordered by bucket id.
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub outcomes: Vec<BucketOutcome<T>>,
}

/// Summary counts, for logging and job stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutSummary {
    pub buckets: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl<T> FanOutReport<T> {
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (BucketId, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|value| (o.bucket, value)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &FanOutError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    pub fn summary(&self) -> FanOutSummary {
        let failed = self.failures().count();
        FanOutSummary {
            buckets: self.outcomes.len(),
            succeeded: self.outcomes.len() - failed,
            failed,
        }
    }

    /// All per-bucket values, or the first failure.
    pub fn into_results(self) -> Result<Vec<(BucketId, T)>, FanOutError> {
        self.outcomes
            .into_iter()
            .map(|o| o.result.map(|value| (o.bucket, value)))
            .collect()
    }
}

/// Runs a unit of work for every bucket of a bucket set, in parallel.
#[derive(Debug, Clone)]
pub struct BucketFanOut {
    name: String,
}

impl Default for BucketFanOut {
    fn default() -> Self {
        Self::new("bucket-scan")
    }
}

impl BucketFanOut {
    /// `name` prefixes the worker thread names (`<name>-<bucket>`).
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `work` once per bucket in `[0, buckets)`, each on its own thread, and wait
    /// for all of them.
    pub fn run<T, F>(&self, buckets: BucketCount, work: F) -> FanOutReport<T>
    where
        T: Send,
        F: Fn(BucketId) -> anyhow::Result<T> + Sync,
    {
        let work = &work;
        let outcomes = thread::scope(|scope| {
            let spawned: Vec<_> = buckets
                .buckets()
                .map(|bucket| {
                    let handle = thread::Builder::new()
                        .name(format!("{}-{bucket}", self.name))
                        .spawn_scoped(scope, move || work(bucket));
                    (bucket, handle)
                })
                .collect();

            spawned
                .into_iter()
                .map(|(bucket, handle)| {
                    let result = match handle {
                        Err(source) => Err(FanOutError::Spawn { bucket, source }),
                        Ok(handle) => match handle.join() {
                            Err(_) => Err(FanOutError::Panicked { bucket }),
                            Ok(Err(source)) => Err(FanOutError::Failed { bucket, source }),
                            Ok(Ok(value)) => Ok(value),
                        },
                    };
                    if let Err(err) = &result {
                        warn!(fan_out = %self.name, %bucket, error = %err, "bucket worker failed");
                    }
                    BucketOutcome { bucket, result }
                })
                .collect()
        });

        let report = FanOutReport { outcomes };
        let summary = report.summary();
        debug!(
            fan_out = %self.name,
            buckets = summary.buckets,
            failed = summary.failed,
            "fan-out finished"
        );
        report
    }

    /// Visit every index entry, one scan per bucket. Each bucket reports how many
    /// entries it visited.
    pub fn scan_index<I, F>(&self, index: &I, visit: F) -> FanOutReport<usize>
    where
        I: ResourceIndex + ?Sized,
        F: Fn(&ResourceIndexEntry) -> anyhow::Result<()> + Sync,
    {
        self.run(index.index_buckets(), |bucket| {
            let mut visited = 0;
            for entry in IndexScan::new(index, bucket) {
                visit(&entry?)?;
                visited += 1;
            }
            Ok(visited)
        })
    }

    /// Visit every commit-log entry committed inside `range`, one scan per bucket.
    pub fn scan_commit_log<L, F>(&self, log: &L, range: TimeRange, visit: F) -> FanOutReport<usize>
    where
        L: CommitLog + ?Sized,
        F: Fn(&CommitLogEntry) -> anyhow::Result<()> + Sync,
    {
        self.run(log.log_buckets(), |bucket| {
            let mut visited = 0;
            for entry in CommitLogScan::new(log, ScanCursor::start(bucket), range) {
                visit(&entry?)?;
                visited += 1;
            }
            Ok(visited)
        })
    }
}
