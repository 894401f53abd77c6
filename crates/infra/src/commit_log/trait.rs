use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use regshard_core::{BucketId, ResourceKey};

use crate::bucket::BucketCount;
use crate::commit_log::scan::{CommitLogScan, ScanCursor};
use crate::error::StoreError;

/// One change to one registry resource.
///
/// `Delete` means the resource is permanently gone, not merely flagged for deletion;
/// a soft delete is an `Upsert` of the flagged record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Upsert { key: ResourceKey, record: JsonValue },
    Delete { key: ResourceKey },
}

impl Mutation {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Mutation::Upsert { key, .. } | Mutation::Delete { key } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Mutation::Delete { .. })
    }
}

/// The mutations performed by one transaction, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationSet(Vec<Mutation>);

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, key: ResourceKey, record: JsonValue) -> Self {
        self.0.push(Mutation::Upsert { key, record });
        self
    }

    pub fn delete(mut self, key: ResourceKey) -> Self {
        self.0.push(Mutation::Delete { key });
        self
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.0.push(mutation);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Mutation> {
        self.0.last()
    }

    /// The single resource every mutation targets, if there is exactly one.
    pub fn single_key(&self) -> Option<&ResourceKey> {
        let first = self.0.first()?.key();
        self.0.iter().all(|m| m.key() == first).then_some(first)
    }
}

impl From<Vec<Mutation>> for MutationSet {
    fn from(value: Vec<Mutation>) -> Self {
        Self(value)
    }
}

/// Address of one committed transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitPosition {
    pub bucket: BucketId,
    pub transaction_id: u64,
}

/// An immutable, committed commit-log row.
///
/// `payload` is the JSON-serialized [`MutationSet`]; `checksum` is its CRC-32 and
/// `payload_len` its byte length. Both are checked before the payload is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogEntry {
    pub bucket: BucketId,

    /// Strictly increasing within `bucket`, starting at 1. No meaning across buckets.
    pub transaction_id: u64,

    pub committed_at: DateTime<Utc>,
    pub payload: String,
    pub checksum: u32,
    pub payload_len: u32,
}

impl CommitLogEntry {
    /// Serialize a mutation set into a new row.
    pub fn seal(
        bucket: BucketId,
        transaction_id: u64,
        committed_at: DateTime<Utc>,
        mutations: &MutationSet,
    ) -> Result<Self, StoreError> {
        let payload = serde_json::to_string(mutations)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| StoreError::permanent("mutation payload exceeds 4 GiB"))?;
        Ok(Self {
            bucket,
            transaction_id,
            committed_at,
            checksum: crc32fast::hash(payload.as_bytes()),
            payload_len,
            payload,
        })
    }

    pub fn position(&self) -> CommitPosition {
        CommitPosition {
            bucket: self.bucket,
            transaction_id: self.transaction_id,
        }
    }

    /// Check the stored length and checksum against the payload.
    pub fn verify(&self) -> Result<(), StoreError> {
        if self.payload.len() != self.payload_len as usize {
            return Err(self.corrupt(format!(
                "length mismatch: stored {}, actual {}",
                self.payload_len,
                self.payload.len()
            )));
        }
        let actual = crc32fast::hash(self.payload.as_bytes());
        if actual != self.checksum {
            return Err(self.corrupt(format!(
                "checksum mismatch: stored {:08x}, actual {actual:08x}",
                self.checksum
            )));
        }
        Ok(())
    }

    /// Verify and decode the mutation set.
    pub fn mutations(&self) -> Result<MutationSet, StoreError> {
        self.verify()?;
        serde_json::from_str(&self.payload).map_err(|e| self.corrupt(format!("undecodable payload: {e}")))
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            bucket: self.bucket,
            transaction_id: self.transaction_id,
            reason,
        }
    }
}

/// Half-open time window `[from, to)` over `committed_at`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn all() -> Self {
        Self {
            from: DateTime::<Utc>::MIN_UTC,
            to: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

/// Bucketed, append-only commit log.
///
/// Each bucket is one consistency partition: appends to a bucket are serialized and
/// receive consecutive transaction ids; appends to different buckets are independent.
/// Sustained append throughput therefore scales with the bucket count, provided keys
/// spread evenly across buckets.
pub trait CommitLog: Send + Sync {
    /// Bucket count in force for this process.
    fn log_buckets(&self) -> BucketCount;

    /// Append a mutation set as the next transaction of `bucket`.
    ///
    /// Runs inside the same atomic unit as the mutation it records. Callers wrap it in
    /// the backoff controller; `Transient` failures are retryable, `Permanent` are not.
    fn append(&self, bucket: BucketId, mutations: &MutationSet) -> Result<CommitLogEntry, StoreError>;

    /// Up to `limit` entries of `bucket` with `transaction_id > after_transaction_id`
    /// whose `committed_at` falls in `range`, ordered by transaction id.
    fn read_page(
        &self,
        bucket: BucketId,
        after_transaction_id: u64,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<CommitLogEntry>, StoreError>;

    /// Delete up to `limit` entries of `bucket` committed strictly before `watermark`,
    /// oldest transaction first. Returns how many rows were deleted.
    fn delete_before(
        &self,
        bucket: BucketId,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;

    /// Lazily scan `bucket` over `[from, to)` in transaction-id order.
    fn scan_range(
        &self,
        bucket: BucketId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CommitLogScan<'_, Self>
    where
        Self: Sized,
    {
        CommitLogScan::new(self, ScanCursor::start(bucket), TimeRange::new(from, to))
    }

    /// Resume a scan from a saved cursor.
    fn scan_from(&self, cursor: ScanCursor, range: TimeRange) -> CommitLogScan<'_, Self>
    where
        Self: Sized,
    {
        CommitLogScan::new(self, cursor, range)
    }
}

impl<S> CommitLog for Arc<S>
where
    S: CommitLog + ?Sized,
{
    fn log_buckets(&self) -> BucketCount {
        (**self).log_buckets()
    }

    fn append(&self, bucket: BucketId, mutations: &MutationSet) -> Result<CommitLogEntry, StoreError> {
        (**self).append(bucket, mutations)
    }

    fn read_page(
        &self,
        bucket: BucketId,
        after_transaction_id: u64,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<CommitLogEntry>, StoreError> {
        (**self).read_page(bucket, after_transaction_id, range, limit)
    }

    fn delete_before(
        &self,
        bucket: BucketId,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        (**self).delete_before(bucket, watermark, limit)
    }
}
