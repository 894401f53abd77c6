//! Lazy, restartable commit-log scans.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use regshard_core::BucketId;

use super::r#trait::{CommitLog, CommitLogEntry, TimeRange};
use crate::error::StoreError;

/// Entries fetched from the store per round trip.
pub const SCAN_PAGE_SIZE: usize = 100;

/// Resumable scan position: everything up to and including `after_transaction_id`
/// has already been consumed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub bucket: BucketId,
    pub after_transaction_id: u64,
}

impl ScanCursor {
    pub fn start(bucket: BucketId) -> Self {
        Self {
            bucket,
            after_transaction_id: 0,
        }
    }
}

/// Iterator over one bucket's entries in transaction-id order.
///
/// Pages are fetched on demand, every entry is checksum-verified before it is yielded,
/// and the first failure ends the scan. [`CommitLogScan::cursor`] reports the position
/// after the last yielded entry so a later scan can pick up from there.
#[derive(Debug)]
pub struct CommitLogScan<'a, L: ?Sized> {
    log: &'a L,
    cursor: ScanCursor,
    range: TimeRange,
    page_size: usize,
    buffer: VecDeque<CommitLogEntry>,
    exhausted: bool,
}

impl<'a, L> CommitLogScan<'a, L>
where
    L: CommitLog + ?Sized,
{
    pub fn new(log: &'a L, cursor: ScanCursor, range: TimeRange) -> Self {
        Self {
            log,
            cursor,
            range,
            page_size: SCAN_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let page = self.log.read_page(
            self.cursor.bucket,
            self.cursor.after_transaction_id,
            &self.range,
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<L> Iterator for CommitLogScan<'_, L>
where
    L: CommitLog + ?Sized,
{
    type Item = Result<CommitLogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let entry = self.buffer.pop_front()?;
        if let Err(err) = entry.verify() {
            self.exhausted = true;
            self.buffer.clear();
            return Some(Err(err));
        }
        self.cursor.after_transaction_id = entry.transaction_id;
        Some(Ok(entry))
    }
}
