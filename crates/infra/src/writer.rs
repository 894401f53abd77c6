//! Write path for resource mutations.
//!
//! ```text
//! (key, mutation set)
//!   ↓
//! 1. Assign the commit-log bucket from the key
//!   ↓
//! 2. Commit log append + index change, one partition-local transaction
//!   ↓
//! 3. On transient failure, retry the whole transaction with backoff
//! ```
//!
//! Work that touches several resources is never one transaction. [`ShardedWriter::record_each`]
//! commits each resource separately, in order, and reports exactly which ones made it,
//! so callers can tolerate "first committed, second pending".

use serde::Serialize;
use tracing::{debug, warn};

use regshard_core::{BucketId, ResourceKey};

use crate::backoff::{Backoff, RetryError, Sleeper, ThreadSleeper};
use crate::bucket::resource_bucket;
use crate::commit_log::{CommitLogEntry, MutationSet};
use crate::datastore::{CommitReceipt, CommitRequest, PartitionStore};
use crate::error::StoreError;
use crate::resource_index::ResourceIndexEntry;

pub type WriteResult<T> = Result<T, RetryError<StoreError>>;

/// Result of a multi-resource write.
#[derive(Debug)]
pub struct SequentialWrite {
    /// Transactions that committed, in submission order.
    pub committed: Vec<CommitReceipt>,
    /// The resource whose transaction failed, if any.
    pub failed: Option<(ResourceKey, RetryError<StoreError>)>,
    /// Resources never attempted because an earlier one failed.
    pub pending: Vec<ResourceKey>,
}

impl SequentialWrite {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.pending.is_empty()
    }
}

/// Summary of a [`SequentialWrite`], for logs and callers that only need the shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequentialWriteSummary {
    pub committed: usize,
    pub failed: Option<ResourceKey>,
    pub pending: usize,
}

impl From<&SequentialWrite> for SequentialWriteSummary {
    fn from(value: &SequentialWrite) -> Self {
        Self {
            committed: value.committed.len(),
            failed: value.failed.as_ref().map(|(key, _)| key.clone()),
            pending: value.pending.len(),
        }
    }
}

/// Records resource mutations through a [`PartitionStore`], retried by a [`Backoff`].
#[derive(Debug)]
pub struct ShardedWriter<S, Sl = ThreadSleeper> {
    store: S,
    backoff: Backoff<Sl>,
}

impl<S: PartitionStore> ShardedWriter<S, ThreadSleeper> {
    pub fn new(store: S) -> Self {
        Self::with_backoff(store, Backoff::default())
    }
}

impl<S, Sl> ShardedWriter<S, Sl>
where
    S: PartitionStore,
    Sl: Sleeper,
{
    pub fn with_backoff(store: S, backoff: Backoff<Sl>) -> Self {
        Self { store, backoff }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Commit-log bucket a resource's transactions are recorded in.
    pub fn log_bucket(&self, key: &ResourceKey) -> BucketId {
        resource_bucket(key, self.store.log_buckets())
    }

    /// Record one transaction against `key`: the log entry and the index change commit
    /// together or not at all.
    pub fn record(&self, key: &ResourceKey, mutations: MutationSet) -> WriteResult<CommitReceipt> {
        let request = CommitRequest {
            key: key.clone(),
            log_bucket: self.log_bucket(key),
            mutations,
        };
        let receipt = self
            .backoff
            .retry("datastore.commit", |_| self.store.commit(&request))?;
        debug!(
            %key,
            bucket = %receipt.entry.bucket,
            transaction_id = receipt.entry.transaction_id,
            "recorded mutation"
        );
        Ok(receipt)
    }

    /// Record one independent transaction per resource, in order, stopping at the
    /// first failure.
    pub fn record_each<I>(&self, changes: I) -> SequentialWrite
    where
        I: IntoIterator<Item = (ResourceKey, MutationSet)>,
    {
        let mut changes = changes.into_iter();
        let mut committed = Vec::new();

        while let Some((key, mutations)) = changes.next() {
            match self.record(&key, mutations) {
                Ok(receipt) => committed.push(receipt),
                Err(err) => {
                    let pending: Vec<ResourceKey> = changes.by_ref().map(|(key, _)| key).collect();
                    warn!(
                        %key,
                        committed = committed.len(),
                        pending = pending.len(),
                        error = %err,
                        "multi-resource write stopped part way"
                    );
                    return SequentialWrite {
                        committed,
                        failed: Some((key, err)),
                        pending,
                    };
                }
            }
        }

        SequentialWrite {
            committed,
            failed: None,
            pending: Vec::new(),
        }
    }

    /// Append to the commit log alone, retried.
    pub fn append(&self, bucket: BucketId, mutations: &MutationSet) -> WriteResult<CommitLogEntry> {
        self.backoff
            .retry("commit_log.append", |_| self.store.append(bucket, mutations))
    }

    /// Ensure `key` is indexed, retried.
    pub fn upsert(&self, key: &ResourceKey) -> WriteResult<ResourceIndexEntry> {
        self.backoff
            .retry("resource_index.upsert", |_| self.store.upsert(key))
    }

    /// Drop the index entry of a permanently deleted resource, retried.
    pub fn remove(&self, key: &ResourceKey) -> WriteResult<Option<ResourceIndexEntry>> {
        self.backoff
            .retry("resource_index.remove", |_| self.store.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::bucket::BucketLayout;
    use crate::datastore::{InMemoryDatastore, IndexChange};
    use crate::resource_index::ResourceIndex;

    fn writer(max_attempts: u32) -> ShardedWriter<InMemoryDatastore> {
        ShardedWriter::with_backoff(
            InMemoryDatastore::new(BucketLayout::new(4, 4).unwrap()),
            Backoff::new(RetryPolicy::new(max_attempts, Duration::ZERO)),
        )
    }

    fn domain(name: &str) -> ResourceKey {
        ResourceKey::domain(name).unwrap()
    }

    fn upsert(name: &str) -> MutationSet {
        MutationSet::new().upsert(domain(name), serde_json::json!({"name": name}))
    }

    #[test]
    fn record_lands_in_the_keys_bucket() {
        let writer = writer(1);
        let receipt = writer.record(&domain("a.tld"), upsert("a.tld")).unwrap();
        assert_eq!(receipt.entry.bucket, writer.log_bucket(&domain("a.tld")));
        assert!(matches!(receipt.index, IndexChange::Created { .. }));
    }

    #[test]
    fn transient_commit_failures_are_retried() {
        let writer = writer(4);
        writer.store().inject_transient_failures(3);

        let receipt = writer.record(&domain("a.tld"), upsert("a.tld")).unwrap();
        assert_eq!(receipt.entry.transaction_id, 1);
    }

    #[test]
    fn exhausted_commit_keeps_transient_kind() {
        let writer = writer(2);
        writer.store().inject_transient_failures(2);

        let err = writer.record(&domain("a.tld"), upsert("a.tld")).unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 2, source: StoreError::Transient(_) }));
        assert!(writer.store().get(&domain("a.tld")).unwrap().is_none());
    }

    #[test]
    fn mismatched_mutation_set_is_rejected_without_retry() {
        let writer = writer(5);
        let err = writer.record(&domain("a.tld"), upsert("b.tld")).unwrap_err();
        assert!(matches!(err, RetryError::Aborted(StoreError::Permanent(_))));
    }

    #[test]
    fn record_each_reports_first_committed_second_pending() {
        let writer = writer(1);
        let changes = vec![
            (domain("a.tld"), upsert("a.tld")),
            (domain("b.tld"), upsert("b.tld")),
            (domain("c.tld"), upsert("c.tld")),
        ];

        let mut yielded = 0;
        let result = writer.record_each(changes.into_iter().inspect(|_| {
            yielded += 1;
            if yielded == 2 {
                writer.store().inject_fault(StoreError::transient("partition busy"));
            }
        }));

        assert!(!result.is_complete());
        assert_eq!(result.committed.len(), 1);
        assert_eq!(result.failed.as_ref().map(|(k, _)| k.clone()), Some(domain("b.tld")));
        assert_eq!(result.pending, vec![domain("c.tld")]);
        assert!(writer.store().get(&domain("a.tld")).unwrap().is_some());
        assert!(writer.store().get(&domain("b.tld")).unwrap().is_none());

        let summary = SequentialWriteSummary::from(&result);
        assert_eq!((summary.committed, summary.pending), (1, 1));
    }

    #[test]
    fn remove_is_idempotent() {
        let writer = writer(1);
        writer.upsert(&domain("a.tld")).unwrap();
        assert!(writer.remove(&domain("a.tld")).unwrap().is_some());
        assert!(writer.remove(&domain("a.tld")).unwrap().is_none());
    }
}
