use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use regshard_core::{BucketId, Clock, ResourceKey, SystemClock};

use super::{CommitReceipt, CommitRequest, IndexChange, PartitionStore};
use crate::bucket::{check_growth, resource_bucket, BucketCount, BucketCountDecreased, BucketLayout};
use crate::commit_log::{CommitLog, CommitLogEntry, CommitPosition, MutationSet, TimeRange};
use crate::error::StoreError;
use crate::resource_index::{ResourceIndex, ResourceIndexEntry};

#[derive(Debug, Default)]
struct LogPartition {
    last_transaction_id: u64,
    entries: BTreeMap<u64, CommitLogEntry>,
}

#[derive(Debug, Default)]
struct IndexPartition {
    entries: BTreeMap<ResourceKey, ResourceIndexEntry>,
}

type IndexGuards<'a> = Vec<(BucketId, RwLockWriteGuard<'a, IndexPartition>)>;

/// In-memory partitioned store.
///
/// Intended for tests/dev. Each commit-log bucket and each index bucket is its own
/// lock, standing in for one store partition. Locks are always taken log partition
/// first, then index partitions in ascending bucket order.
///
/// Index rows created under an earlier, smaller bucket count stay in the bucket they
/// were created in; lookups probe the bucket each historical count would have chosen.
#[derive(Debug)]
pub struct InMemoryDatastore<C = SystemClock> {
    layout: BucketLayout,
    /// Every index bucket count this data has been served with, ascending.
    index_counts: Vec<BucketCount>,
    clock: C,
    log: Vec<Mutex<LogPartition>>,
    index: Vec<RwLock<IndexPartition>>,
    faults: Mutex<VecDeque<StoreError>>,
}

impl InMemoryDatastore<SystemClock> {
    pub fn new(layout: BucketLayout) -> Self {
        Self::with_clock(layout, SystemClock)
    }
}

impl<C: Clock> InMemoryDatastore<C> {
    pub fn with_clock(layout: BucketLayout, clock: C) -> Self {
        Self {
            layout,
            index_counts: vec![layout.resource_index],
            clock,
            log: (0..layout.commit_log.get()).map(|_| Mutex::default()).collect(),
            index: (0..layout.resource_index.get()).map(|_| RwLock::default()).collect(),
            faults: Mutex::default(),
        }
    }

    /// Serve the same data under a new layout, as a redeploy would.
    ///
    /// Fails if either bucket count would shrink. Existing rows keep their buckets.
    pub fn reopen(self, layout: BucketLayout) -> Result<Self, BucketCountDecreased> {
        check_growth(Some(&self.layout), &layout)?;

        let Self {
            layout: previous,
            mut index_counts,
            clock,
            mut log,
            mut index,
            faults,
        } = self;

        log.resize_with(layout.commit_log.get() as usize, Mutex::default);
        index.resize_with(layout.resource_index.get() as usize, RwLock::default);
        if layout.resource_index > previous.resource_index {
            index_counts.push(layout.resource_index);
        }

        info!(
            commit_log_from = previous.commit_log.get(),
            commit_log_to = layout.commit_log.get(),
            index_from = previous.resource_index.get(),
            index_to = layout.resource_index.get(),
            "datastore reopened with new bucket layout"
        );

        Ok(Self {
            layout,
            index_counts,
            clock,
            log,
            index,
            faults,
        })
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Make the next mutating call fail with `err` before it touches any row.
    pub fn inject_fault(&self, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    pub fn inject_transient_failures(&self, count: usize) {
        for n in 0..count {
            self.inject_fault(StoreError::transient(format!("injected contention #{}", n + 1)));
        }
    }

    fn take_fault(&self) -> Result<(), StoreError> {
        match self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn log_partition(&self, bucket: BucketId) -> Result<MutexGuard<'_, LogPartition>, StoreError> {
        self.log
            .get(bucket.get() as usize)
            .ok_or_else(|| {
                StoreError::permanent(format!(
                    "commit log bucket {bucket} out of range (count {})",
                    self.layout.commit_log
                ))
            })?
            .lock()
            .map_err(poisoned)
    }

    fn index_partition(&self, bucket: BucketId) -> Result<&RwLock<IndexPartition>, StoreError> {
        self.index.get(bucket.get() as usize).ok_or_else(|| {
            StoreError::permanent(format!(
                "index bucket {bucket} out of range (count {})",
                self.layout.resource_index
            ))
        })
    }

    fn primary_bucket(&self, key: &ResourceKey) -> BucketId {
        resource_bucket(key, self.layout.resource_index)
    }

    /// Buckets `key` could live in, ascending and de-duplicated.
    fn candidate_buckets(&self, key: &ResourceKey) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = self
            .index_counts
            .iter()
            .map(|count| resource_bucket(key, *count))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        buckets
    }

    fn lock_candidates(&self, key: &ResourceKey) -> Result<IndexGuards<'_>, StoreError> {
        self.candidate_buckets(key)
            .into_iter()
            .map(|bucket| {
                let guard = self.index_partition(bucket)?.write().map_err(poisoned)?;
                Ok((bucket, guard))
            })
            .collect()
    }

    fn new_entry(&self, key: &ResourceKey, latest: Option<CommitPosition>, now: DateTime<Utc>) -> ResourceIndexEntry {
        ResourceIndexEntry {
            key: key.clone(),
            bucket: self.primary_bucket(key),
            created_at: now,
            latest,
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::permanent("partition lock poisoned")
}

fn find_entry<'g>(
    guards: &'g mut IndexGuards<'_>,
    key: &ResourceKey,
) -> Option<&'g mut ResourceIndexEntry> {
    guards
        .iter_mut()
        .find_map(|(_, partition)| partition.entries.get_mut(key))
}

fn insert_entry(guards: &mut IndexGuards<'_>, entry: ResourceIndexEntry) -> Result<(), StoreError> {
    let (_, partition) = guards
        .iter_mut()
        .find(|(bucket, _)| *bucket == entry.bucket)
        .ok_or_else(|| StoreError::permanent(format!("index bucket {} not locked", entry.bucket)))?;
    partition.entries.insert(entry.key.clone(), entry);
    Ok(())
}

fn remove_entry(guards: &mut IndexGuards<'_>, key: &ResourceKey) -> Option<ResourceIndexEntry> {
    guards
        .iter_mut()
        .find_map(|(_, partition)| partition.entries.remove(key))
}

impl<C: Clock> CommitLog for InMemoryDatastore<C> {
    fn log_buckets(&self) -> BucketCount {
        self.layout.commit_log
    }

    fn append(&self, bucket: BucketId, mutations: &MutationSet) -> Result<CommitLogEntry, StoreError> {
        if mutations.is_empty() {
            return Err(StoreError::permanent("empty mutation set"));
        }
        self.take_fault()?;

        let mut partition = self.log_partition(bucket)?;
        let entry = CommitLogEntry::seal(
            bucket,
            partition.last_transaction_id + 1,
            self.clock.now(),
            mutations,
        )?;
        partition.last_transaction_id = entry.transaction_id;
        partition.entries.insert(entry.transaction_id, entry.clone());
        Ok(entry)
    }

    fn read_page(
        &self,
        bucket: BucketId,
        after_transaction_id: u64,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<CommitLogEntry>, StoreError> {
        let partition = self.log_partition(bucket)?;
        Ok(partition
            .entries
            .range((Bound::Excluded(after_transaction_id), Bound::Unbounded))
            .map(|(_, entry)| entry)
            .filter(|entry| range.contains(entry.committed_at))
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_before(
        &self,
        bucket: BucketId,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        self.take_fault()?;

        let mut partition = self.log_partition(bucket)?;
        let doomed: Vec<u64> = partition
            .entries
            .values()
            .filter(|entry| entry.committed_at < watermark)
            .take(limit)
            .map(|entry| entry.transaction_id)
            .collect();
        for transaction_id in &doomed {
            partition.entries.remove(transaction_id);
        }
        Ok(doomed.len())
    }
}

impl<C: Clock> ResourceIndex for InMemoryDatastore<C> {
    fn index_buckets(&self) -> BucketCount {
        self.layout.resource_index
    }

    fn upsert(&self, key: &ResourceKey) -> Result<ResourceIndexEntry, StoreError> {
        self.take_fault()?;

        let mut guards = self.lock_candidates(key)?;
        if let Some(existing) = find_entry(&mut guards, key) {
            return Ok(existing.clone());
        }
        let entry = self.new_entry(key, None, self.clock.now());
        insert_entry(&mut guards, entry.clone())?;
        Ok(entry)
    }

    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError> {
        for bucket in self.candidate_buckets(key) {
            let partition = self.index_partition(bucket)?.read().map_err(poisoned)?;
            if let Some(entry) = partition.entries.get(key) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    fn remove(&self, key: &ResourceKey) -> Result<Option<ResourceIndexEntry>, StoreError> {
        self.take_fault()?;

        let mut guards = self.lock_candidates(key)?;
        Ok(remove_entry(&mut guards, key))
    }

    fn read_index_page(
        &self,
        bucket: BucketId,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> Result<Vec<ResourceIndexEntry>, StoreError> {
        let partition = self.index_partition(bucket)?.read().map_err(poisoned)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(partition
            .entries
            .range::<ResourceKey, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

impl<C: Clock> PartitionStore for InMemoryDatastore<C> {
    fn layout(&self) -> BucketLayout {
        self.layout
    }

    fn commit(&self, request: &CommitRequest) -> Result<CommitReceipt, StoreError> {
        request.validate()?;
        self.take_fault()?;

        let mut partition = self.log_partition(request.log_bucket)?;
        let now = self.clock.now();
        let entry = CommitLogEntry::seal(
            request.log_bucket,
            partition.last_transaction_id + 1,
            now,
            &request.mutations,
        )?;

        let mut guards = self.lock_candidates(&request.key)?;
        let position = Some(entry.position());
        let index = if request.deletes_resource() {
            match remove_entry(&mut guards, &request.key) {
                Some(entry) => IndexChange::Removed { entry },
                None => IndexChange::Absent,
            }
        } else if let Some(existing) = find_entry(&mut guards, &request.key) {
            existing.latest = position;
            IndexChange::Updated {
                entry: existing.clone(),
            }
        } else {
            let created = self.new_entry(&request.key, position, now);
            insert_entry(&mut guards, created.clone())?;
            IndexChange::Created { entry: created }
        };

        partition.last_transaction_id = entry.transaction_id;
        partition.entries.insert(entry.transaction_id, entry.clone());

        debug!(
            key = %request.key,
            bucket = %entry.bucket,
            transaction_id = entry.transaction_id,
            "committed transaction"
        );

        Ok(CommitReceipt { entry, index })
    }
}
