//! Partition-transactional store boundary.
//!
//! The backing store offers atomic multi-row commits inside one partition and only
//! eventual consistency across partitions. [`PartitionStore::commit`] is the single
//! place where a commit-log append and the matching resource-index change happen
//! together: both rows are written, or neither is.

pub mod in_memory;

use serde::{Deserialize, Serialize};

use regshard_core::{BucketId, ResourceKey};

use crate::bucket::BucketLayout;
use crate::commit_log::{CommitLog, CommitLogEntry, MutationSet};
use crate::error::StoreError;
use crate::resource_index::{ResourceIndex, ResourceIndexEntry};

pub use in_memory::InMemoryDatastore;

/// A transaction against one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub key: ResourceKey,
    pub log_bucket: BucketId,
    pub mutations: MutationSet,
}

impl CommitRequest {
    /// Reject requests that cannot be committed atomically.
    ///
    /// A mutation set touching several resources would span several index partitions;
    /// callers split it into one request per resource instead.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self.mutations.single_key() {
            None if self.mutations.is_empty() => Err(StoreError::permanent("empty mutation set")),
            Some(key) if key == &self.key => Ok(()),
            Some(key) => Err(StoreError::permanent(format!(
                "mutation set targets {key}, request is for {}",
                self.key
            ))),
            None => Err(StoreError::permanent(format!(
                "mutation set for {} touches more than one resource",
                self.key
            ))),
        }
    }

    /// Whether the transaction leaves the resource permanently deleted.
    pub fn deletes_resource(&self) -> bool {
        self.mutations.last().is_some_and(|m| m.is_delete())
    }
}

/// How a commit changed the resource index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum IndexChange {
    Created { entry: ResourceIndexEntry },
    Updated { entry: ResourceIndexEntry },
    Removed { entry: ResourceIndexEntry },
    /// A delete of a resource that was never indexed.
    Absent,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub entry: CommitLogEntry,
    pub index: IndexChange,
}

/// A store that can commit a log append and an index change as one unit.
pub trait PartitionStore: CommitLog + ResourceIndex {
    /// Bucket counts in force for this process.
    fn layout(&self) -> BucketLayout;

    /// Append `request.mutations` to `request.log_bucket` and apply the resulting
    /// index change for `request.key`, atomically.
    fn commit(&self, request: &CommitRequest) -> Result<CommitReceipt, StoreError>;
}

impl<S> PartitionStore for std::sync::Arc<S>
where
    S: PartitionStore + ?Sized,
{
    fn layout(&self) -> BucketLayout {
        (**self).layout()
    }

    fn commit(&self, request: &CommitRequest) -> Result<CommitReceipt, StoreError> {
        (**self).commit(request)
    }
}
