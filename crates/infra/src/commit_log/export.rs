//! Incremental commit-log export.
//!
//! Each run exports, per bucket, every entry after the bucket's watermark and committed
//! before an upper bound, in fixed-size batches. A bucket's watermark moves only after
//! the sink has accepted the batch, so an interrupted export resumes where the last
//! accepted batch ended and may at worst hand the sink one batch twice.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use regshard_core::BucketId;

use super::r#trait::{CommitLog, CommitLogEntry, TimeRange};
use super::scan::ScanCursor;
use crate::backoff::{Backoff, RetryError, Sleeper, ThreadSleeper};
use crate::error::StoreError;

/// Transactions handed to the sink per batch.
pub const DEFAULT_EXPORT_BATCH_SIZE: usize = 100;

/// Persistence for per-bucket export watermarks.
pub trait WatermarkStore: Send + Sync {
    /// Position after the last exported entry of `bucket`, if any.
    fn get(&self, bucket: BucketId) -> Result<Option<ScanCursor>, StoreError>;

    fn update(&self, cursor: ScanCursor) -> Result<(), StoreError>;

    /// Forget every watermark, forcing the next run to export from the beginning.
    fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory watermark store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    inner: RwLock<HashMap<BucketId, ScanCursor>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for InMemoryWatermarkStore {
    fn get(&self, bucket: BucketId) -> Result<Option<ScanCursor>, StoreError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&bucket).copied())
    }

    fn update(&self, cursor: ScanCursor) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(cursor.bucket, cursor);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

impl<W: WatermarkStore + ?Sized> WatermarkStore for std::sync::Arc<W> {
    fn get(&self, bucket: BucketId) -> Result<Option<ScanCursor>, StoreError> {
        (**self).get(bucket)
    }

    fn update(&self, cursor: ScanCursor) -> Result<(), StoreError> {
        (**self).update(cursor)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

/// Destination for exported batches.
pub trait ExportSink {
    /// Accept one batch of verified entries from `bucket`, in transaction-id order.
    /// Returning `Ok` commits the batch: the watermark moves past it.
    fn write_batch(&mut self, bucket: BucketId, entries: &[CommitLogEntry]) -> anyhow::Result<()>;
}

/// Writes each entry as one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ExportSink for JsonLinesSink<W> {
    fn write_batch(&mut self, _bucket: BucketId, entries: &[CommitLogEntry]) -> anyhow::Result<()> {
        for entry in entries {
            serde_json::to_writer(&mut self.writer, entry)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        self.written += entries.len();
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("commit log read failed: {0}")]
    Store(#[from] RetryError<StoreError>),

    #[error("watermark store failed: {0}")]
    Watermark(StoreError),

    #[error("export sink rejected batch from bucket {bucket}: {source}")]
    Sink {
        bucket: BucketId,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub upper_bound: DateTime<Utc>,
    pub exported: BTreeMap<BucketId, usize>,
}

impl ExportReport {
    pub fn total(&self) -> usize {
        self.exported.values().sum()
    }
}

/// Exports commit-log diffs between the stored watermarks and an upper bound.
#[derive(Debug)]
pub struct CommitLogDiffExporter<L, W, S = ThreadSleeper> {
    log: L,
    watermarks: W,
    batch_size: usize,
    backoff: Backoff<S>,
}

impl<L, W> CommitLogDiffExporter<L, W, ThreadSleeper>
where
    L: CommitLog,
    W: WatermarkStore,
{
    pub fn new(log: L, watermarks: W) -> Self {
        Self::with_backoff(log, watermarks, Backoff::default())
    }
}

impl<L, W, S> CommitLogDiffExporter<L, W, S>
where
    L: CommitLog,
    W: WatermarkStore,
    S: Sleeper,
{
    pub fn with_backoff(log: L, watermarks: W, backoff: Backoff<S>) -> Self {
        Self {
            log,
            watermarks,
            batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            backoff,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn watermarks(&self) -> &W {
        &self.watermarks
    }

    /// Export every bucket up to, but excluding, entries committed at `upper_bound`.
    pub fn run<K: ExportSink>(&self, upper_bound: DateTime<Utc>, sink: &mut K) -> Result<ExportReport, ExportError> {
        let mut exported = BTreeMap::new();
        for bucket in self.log.log_buckets().buckets() {
            exported.insert(bucket, self.export_bucket(bucket, upper_bound, sink)?);
        }

        let report = ExportReport {
            upper_bound,
            exported,
        };
        info!(
            upper_bound = %report.upper_bound,
            exported = report.total(),
            "commit log diff export finished"
        );
        Ok(report)
    }

    fn export_bucket<K: ExportSink>(
        &self,
        bucket: BucketId,
        upper_bound: DateTime<Utc>,
        sink: &mut K,
    ) -> Result<usize, ExportError> {
        let mut cursor = self
            .watermarks
            .get(bucket)
            .map_err(ExportError::Watermark)?
            .unwrap_or_else(|| ScanCursor::start(bucket));
        let mut exported = 0;

        loop {
            let mut batch = self.backoff.retry("commit_log.read_page", |_| {
                self.log
                    .read_page(bucket, cursor.after_transaction_id, &TimeRange::all(), self.batch_size)
            })?;
            let full_page = batch.len() == self.batch_size;

            let cut = batch
                .iter()
                .position(|entry| entry.committed_at >= upper_bound)
                .unwrap_or(batch.len());
            let reached_bound = cut < batch.len();
            batch.truncate(cut);

            for entry in &batch {
                entry.verify().map_err(|err| ExportError::Store(RetryError::Aborted(err)))?;
            }

            if let Some(last) = batch.last() {
                sink.write_batch(bucket, &batch)
                    .map_err(|source| ExportError::Sink { bucket, source })?;
                cursor.after_transaction_id = last.transaction_id;
                self.watermarks.update(cursor).map_err(ExportError::Watermark)?;
                exported += batch.len();
                debug!(
                    %bucket,
                    batch = batch.len(),
                    watermark = cursor.after_transaction_id,
                    "exported commit log batch"
                );
            }

            if reached_bound || !full_page {
                return Ok(exported);
            }
        }
    }
}
