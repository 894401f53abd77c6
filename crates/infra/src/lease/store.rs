//! Lease storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use regshard_core::{JobKey, LeaseId};

use super::types::{Lease, LeaseError};

/// Single-row compare-and-swap storage for leases and completion times.
///
/// This is the only mutual-exclusion primitive the scheduler relies on.
pub trait LeaseStore: Send + Sync {
    fn load(&self, job_key: &JobKey) -> Result<Option<Lease>, LeaseError>;

    /// Replace the row for `job_key` with `new` if the current row's lease id equals
    /// `expected` (`None` meaning "no row"). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        job_key: &JobKey,
        expected: Option<LeaseId>,
        new: Option<Lease>,
    ) -> Result<bool, LeaseError>;

    /// End time of the last successful run of `job_key`.
    fn last_completion(&self, job_key: &JobKey) -> Result<Option<DateTime<Utc>>, LeaseError>;

    fn record_completion(&self, job_key: &JobKey, at: DateTime<Utc>) -> Result<(), LeaseError>;
}

impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    fn load(&self, job_key: &JobKey) -> Result<Option<Lease>, LeaseError> {
        (**self).load(job_key)
    }

    fn compare_and_swap(
        &self,
        job_key: &JobKey,
        expected: Option<LeaseId>,
        new: Option<Lease>,
    ) -> Result<bool, LeaseError> {
        (**self).compare_and_swap(job_key, expected, new)
    }

    fn last_completion(&self, job_key: &JobKey) -> Result<Option<DateTime<Utc>>, LeaseError> {
        (**self).last_completion(job_key)
    }

    fn record_completion(&self, job_key: &JobKey, at: DateTime<Utc>) -> Result<(), LeaseError> {
        (**self).record_completion(job_key, at)
    }
}

/// In-memory lease store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<JobKey, Lease>>,
    completions: RwLock<HashMap<JobKey, DateTime<Utc>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn load(&self, job_key: &JobKey) -> Result<Option<Lease>, LeaseError> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(leases.get(job_key).cloned())
    }

    fn compare_and_swap(
        &self,
        job_key: &JobKey,
        expected: Option<LeaseId>,
        new: Option<Lease>,
    ) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let current = leases.get(job_key).map(|lease| lease.lease_id);
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(lease) => leases.insert(job_key.clone(), lease),
            None => leases.remove(job_key),
        };
        Ok(true)
    }

    fn last_completion(&self, job_key: &JobKey) -> Result<Option<DateTime<Utc>>, LeaseError> {
        let completions = self.completions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(completions.get(job_key).copied())
    }

    fn record_completion(&self, job_key: &JobKey, at: DateTime<Utc>) -> Result<(), LeaseError> {
        let mut completions = self.completions.write().unwrap_or_else(PoisonError::into_inner);
        completions.insert(job_key.clone(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key() -> JobKey {
        JobKey::new("rde-staging").unwrap()
    }

    #[test]
    fn swap_only_succeeds_against_the_expected_row() {
        let store = InMemoryLeaseStore::new();
        let first = Lease::new(key(), Utc::now(), Duration::from_secs(60));
        let second = Lease::new(key(), Utc::now(), Duration::from_secs(60));

        assert!(store.compare_and_swap(&key(), None, Some(first.clone())).unwrap());
        assert!(!store.compare_and_swap(&key(), None, Some(second.clone())).unwrap());
        assert!(!store
            .compare_and_swap(&key(), Some(second.lease_id), None)
            .unwrap());
        assert_eq!(store.load(&key()).unwrap(), Some(first.clone()));

        assert!(store.compare_and_swap(&key(), Some(first.lease_id), None).unwrap());
        assert_eq!(store.load(&key()).unwrap(), None);
    }

    #[test]
    fn completions_are_kept_per_key() {
        let store = InMemoryLeaseStore::new();
        let at = Utc::now();
        store.record_completion(&key(), at).unwrap();

        assert_eq!(store.last_completion(&key()).unwrap(), Some(at));
        assert_eq!(
            store.last_completion(&JobKey::new("other").unwrap()).unwrap(),
            None
        );
    }
}
