use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use regshard_core::{BucketId, ResourceKey};

use crate::bucket::BucketCount;
use crate::commit_log::CommitPosition;
use crate::error::StoreError;

/// Index row for one live resource.
///
/// `bucket` is assigned once, when the row is created, and never recomputed: after a
/// bucket-count increase the row stays where it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIndexEntry {
    pub key: ResourceKey,
    pub bucket: BucketId,
    pub created_at: DateTime<Utc>,

    /// Commit-log position of the transaction that last wrote the resource record.
    pub latest: Option<CommitPosition>,
}

/// Bucketed index over every live resource.
///
/// Each bucket is one consistency partition, so a scan of a single bucket is strongly
/// consistent. A registry-wide enumeration runs one scan per bucket; there is no
/// ordering across buckets. No caching happens behind this trait.
pub trait ResourceIndex: Send + Sync {
    /// Bucket count in force for this process.
    fn index_buckets(&self) -> BucketCount;

    /// Create the entry for `key` if absent. Re-asserting an existing key is a no-op
    /// that returns the stored entry unchanged.
    fn upsert(&self, key: &ResourceKey) -> Result<ResourceIndexEntry, StoreError>;

    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError>;

    /// Delete the entry for `key`, returning it if it existed.
    ///
    /// Only call this once the resource is permanently gone. A resource that is merely
    /// pending deletion must stay indexed so that reference checks still find it.
    fn remove(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError>;

    /// Up to `limit` entries of `bucket` ordered by key, strictly after `after`.
    fn read_index_page(
        &self,
        bucket: BucketId,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> Result<Vec<ResourceIndexEntry>, StoreError>;

    /// Lazily enumerate every entry of `bucket`.
    fn scan_all(&self, bucket: BucketId) -> IndexScan<'_, Self>
    where
        Self: Sized,
    {
        IndexScan::new(self, bucket)
    }
}

impl<S> ResourceIndex for Arc<S>
where
    S: ResourceIndex + ?Sized,
{
    fn index_buckets(&self) -> BucketCount {
        (**self).index_buckets()
    }

    fn upsert(&self, key: &ResourceKey) -> Result<ResourceIndexEntry, StoreError> {
        (**self).upsert(key)
    }

    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError> {
        (**self).get(key)
    }

    fn remove(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError> {
        (**self).remove(key)
    }

    fn read_index_page(
        &self,
        bucket: BucketId,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> Result<Vec<ResourceIndexEntry>, StoreError> {
        (**self).read_index_page(bucket, after, limit)
    }
}

/// Entries fetched per round trip by [`IndexScan`].
pub const INDEX_PAGE_SIZE: usize = 500;

/// Lazy, finite iterator over one index bucket, ordered by key.
#[derive(Debug)]
pub struct IndexScan<'a, I: ?Sized> {
    index: &'a I,
    bucket: BucketId,
    after: Option<ResourceKey>,
    page_size: usize,
    buffer: VecDeque<ResourceIndexEntry>,
    exhausted: bool,
}

impl<'a, I> IndexScan<'a, I>
where
    I: ResourceIndex + ?Sized,
{
    pub fn new(index: &'a I, bucket: BucketId) -> Self {
        Self {
            index,
            bucket,
            after: None,
            page_size: INDEX_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Resume after a previously seen key.
    pub fn resume_after(mut self, key: ResourceKey) -> Self {
        self.after = Some(key);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Last key yielded so far.
    pub fn position(&self) -> Option<&ResourceKey> {
        self.after.as_ref()
    }
}

impl<I> Iterator for IndexScan<'_, I>
where
    I: ResourceIndex + ?Sized,
{
    type Item = Result<ResourceIndexEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.index.read_index_page(self.bucket, self.after.as_ref(), self.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.after = Some(entry.key.clone());
        Some(Ok(entry))
    }
}
