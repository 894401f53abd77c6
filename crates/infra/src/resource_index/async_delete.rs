//! Delayed reference checks for resource deletion.
//!
//! A delete request for a contact or host is not acted on immediately. It is queued
//! and re-examined once every transaction that could still add a reference has either
//! committed or died, and once any cached copy of the index has expired. Only then can
//! a full index scan prove the resource unreferenced.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use regshard_core::{DomainError, ResourceKey};

use super::fan_out::{BucketFanOut, FanOutReport};
use super::{ResourceIndex, ResourceIndexEntry};

/// Wait between a delete request and its reference check.
///
/// Must be strictly greater than `max_transaction_duration + index_cache_duration`:
/// a transaction that started before the request and adds a reference is then
/// guaranteed to be visible to the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncDeleteDelay {
    delay: Duration,
    max_transaction_duration: Duration,
    index_cache_duration: Duration,
}

impl Default for AsyncDeleteDelay {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(90),
            max_transaction_duration: Duration::from_secs(60),
            index_cache_duration: Duration::ZERO,
        }
    }
}

impl AsyncDeleteDelay {
    pub fn new(
        delay: Duration,
        max_transaction_duration: Duration,
        index_cache_duration: Duration,
    ) -> Result<Self, DomainError> {
        let value = Self {
            delay,
            max_transaction_duration,
            index_cache_duration,
        };
        value.validate()?;
        Ok(value)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let floor = self.minimum();
        if self.delay <= floor {
            return Err(DomainError::validation(format!(
                "async delete delay {}s must exceed transaction bound plus index cache ({}s)",
                self.delay.as_secs_f64(),
                floor.as_secs_f64()
            )));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// `max_transaction_duration + index_cache_duration`; the delay must exceed it.
    pub fn minimum(&self) -> Duration {
        self.max_transaction_duration
            .saturating_add(self.index_cache_duration)
    }

    /// When a request made at `requested_at` becomes eligible for its reference check.
    pub fn due_at(&self, requested_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|delay| requested_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A queued deletion waiting for its reference check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub key: ResourceKey,
    pub requested_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

/// In-memory queue of pending deletions, drained in due order.
#[derive(Debug, Default)]
pub struct PendingDeleteQueue {
    delay: AsyncDeleteDelay,
    pending: Mutex<BTreeMap<(DateTime<Utc>, ResourceKey), PendingDelete>>,
}

impl PendingDeleteQueue {
    pub fn new(delay: AsyncDeleteDelay) -> Self {
        Self {
            delay,
            pending: Mutex::default(),
        }
    }

    pub fn enqueue(&self, key: ResourceKey, requested_at: DateTime<Utc>) -> PendingDelete {
        let pending = PendingDelete {
            due_at: self.delay.due_at(requested_at),
            key,
            requested_at,
        };
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((pending.due_at, pending.key.clone()), pending.clone());
        pending
    }

    /// Remove and return every request due at or before `now`, oldest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<PendingDelete> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let due: Vec<_> = pending
            .keys()
            .take_while(|(due_at, _)| *due_at <= now)
            .cloned()
            .collect();
        due.into_iter()
            .filter_map(|slot| pending.remove(&slot))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scan the whole index for resources that still reference something.
///
/// `references` is asked about every live entry; each bucket reports the keys it
/// matched. A deletion may only proceed if the report is complete and empty.
pub fn referencing_resources<I, F>(
    fan_out: &BucketFanOut,
    index: &I,
    references: F,
) -> FanOutReport<Vec<ResourceKey>>
where
    I: ResourceIndex + ?Sized,
    F: Fn(&ResourceIndexEntry) -> anyhow::Result<bool> + Sync,
{
    fan_out.run(index.index_buckets(), |bucket| {
        let mut found = Vec::new();
        for entry in super::IndexScan::new(index, bucket) {
            let entry = entry?;
            if references(&entry)? {
                found.push(entry.key);
            }
        }
        Ok(found)
    })
}
