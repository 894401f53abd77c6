//! Lease acquisition, release and cooldowns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use regshard_core::{Clock, JobKey, LeaseId, SystemClock};

use super::store::LeaseStore;
use super::types::{AcquireOutcome, JobPolicy, Lease, LeaseError, ReleaseOutcome};
use crate::backoff::{Backoff, RetryError, Sleeper, ThreadSleeper};

/// Compare-and-swap rounds before an acquisition gives up as contended.
const MAX_CAS_ROUNDS: usize = 8;

/// Why a run did not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyHeld {
        holder: LeaseId,
        expires_at: DateTime<Utc>,
    },
    CoolingDown {
        ready_at: DateTime<Utc>,
    },
}

/// Result of [`LeaseScheduler::run_exclusive`].
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed {
        value: T,
        /// The run took over a lease whose previous holder had expired.
        reclaimed: bool,
    },
    Skipped(SkipReason),
}

impl<T> RunOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("job {job_key} failed: {source}")]
    Failed {
        job_key: JobKey,
        #[source]
        source: anyhow::Error,
    },
}

/// Lease state machine per job key: free → held → (released | expired) → free.
///
/// Expiry is lazy: nothing happens when a lease times out; the next `acquire` notices
/// and takes the key over. Store calls behind `acquire` and `release` are retried by
/// the backoff controller when the lease store reports a transient failure.
#[derive(Debug)]
pub struct LeaseScheduler<S, C = SystemClock, Sl = ThreadSleeper> {
    store: S,
    clock: C,
    backoff: Backoff<Sl>,
}

impl<S: LeaseStore> LeaseScheduler<S, SystemClock, ThreadSleeper> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: LeaseStore, C: Clock> LeaseScheduler<S, C, ThreadSleeper> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self::with_parts(store, clock, Backoff::default())
    }
}

impl<S, C, Sl> LeaseScheduler<S, C, Sl>
where
    S: LeaseStore,
    C: Clock,
    Sl: Sleeper,
{
    pub fn with_parts(store: S, clock: C, backoff: Backoff<Sl>) -> Self {
        Self { store, clock, backoff }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Take the lease for `job_key`, unless a live lease holds it.
    ///
    /// `AlreadyHeld` is returned at once; store failures are retried.
    pub fn acquire(&self, job_key: &JobKey, max_duration: Duration) -> Result<AcquireOutcome, LeaseError> {
        self.backoff
            .retry("lease.acquire", |_| self.try_acquire(job_key, max_duration))
            .map_err(RetryError::into_inner)
    }

    fn try_acquire(&self, job_key: &JobKey, max_duration: Duration) -> Result<AcquireOutcome, LeaseError> {
        for _ in 0..MAX_CAS_ROUNDS {
            let now = self.clock.now();
            let current = self.store.load(job_key)?;

            if let Some(held) = &current {
                if !held.is_expired_at(now) {
                    return Err(LeaseError::AlreadyHeld {
                        job_key: job_key.clone(),
                        holder: held.lease_id,
                        expires_at: held.expires_at(),
                    });
                }
            }

            let lease = Lease::new(job_key.clone(), now, max_duration);
            let expected = current.as_ref().map(|held| held.lease_id);
            if !self
                .store
                .compare_and_swap(job_key, expected, Some(lease.clone()))?
            {
                debug!(%job_key, "lease changed underneath acquisition, re-reading");
                continue;
            }

            return Ok(match current {
                Some(previous) => {
                    warn!(
                        %job_key,
                        previous = %previous.lease_id,
                        expired_at = %previous.expires_at(),
                        "reclaimed expired lease"
                    );
                    AcquireOutcome::Reclaimed { lease, previous }
                }
                None => {
                    debug!(%job_key, lease_id = %lease.lease_id, "acquired lease");
                    AcquireOutcome::Acquired(lease)
                }
            });
        }

        Err(LeaseError::Store(format!(
            "lease for {job_key} kept changing during acquisition"
        )))
    }

    /// Give the lease back. Releasing a lease that is no longer current is a no-op.
    pub fn release(&self, lease: &Lease) -> Result<ReleaseOutcome, LeaseError> {
        let swapped = self
            .backoff
            .retry("lease.release", |_| {
                self.store
                    .compare_and_swap(&lease.job_key, Some(lease.lease_id), None)
            })
            .map_err(RetryError::into_inner)?;

        if swapped {
            debug!(job_key = %lease.job_key, lease_id = %lease.lease_id, "released lease");
            Ok(ReleaseOutcome::Released)
        } else {
            warn!(
                job_key = %lease.job_key,
                lease_id = %lease.lease_id,
                "lease was no longer held at release"
            );
            Ok(ReleaseOutcome::NotHeld)
        }
    }

    /// Whether at least `min_spacing` has passed since the last successful run.
    pub fn check_cooldown(&self, job_key: &JobKey, min_spacing: Duration) -> Result<bool, LeaseError> {
        Ok(self.cooldown_ready_at(job_key, min_spacing)?.is_none())
    }

    pub fn record_completion(&self, job_key: &JobKey) -> Result<DateTime<Utc>, LeaseError> {
        let at = self.clock.now();
        self.store.record_completion(job_key, at)?;
        Ok(at)
    }

    /// `Some(ready_at)` while the job is still cooling down.
    fn cooldown_ready_at(
        &self,
        job_key: &JobKey,
        min_spacing: Duration,
    ) -> Result<Option<DateTime<Utc>>, LeaseError> {
        let Some(last) = self.store.last_completion(job_key)? else {
            return Ok(None);
        };
        let ready_at = chrono::Duration::from_std(min_spacing)
            .ok()
            .and_then(|spacing| last.checked_add_signed(spacing))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok((self.clock.now() < ready_at).then_some(ready_at))
    }

    /// Run `job` while holding the lease for `job_key`.
    ///
    /// The lease is released on every exit path, including a panic inside `job`. A
    /// successful run records its completion time before releasing, which starts the
    /// cooldown. A release that still fails after retries is logged and the lease is
    /// left to expire; it never replaces the job's own result. Jobs must be idempotent:
    /// a run cut short by expiry is simply retried from scratch by the next holder.
    pub fn run_exclusive<T, F>(&self, job_key: &JobKey, policy: &JobPolicy, job: F) -> Result<RunOutcome<T>, JobError>
    where
        F: FnOnce(&Lease) -> anyhow::Result<T>,
    {
        let outcome = match self.acquire(job_key, policy.max_duration) {
            Ok(outcome) => outcome,
            Err(LeaseError::AlreadyHeld {
                holder, expires_at, ..
            }) => {
                debug!(%job_key, %holder, "job already running elsewhere, skipping");
                return Ok(RunOutcome::Skipped(SkipReason::AlreadyHeld { holder, expires_at }));
            }
            Err(err) => return Err(err.into()),
        };
        let reclaimed = outcome.was_reclaimed();
        let lease = outcome.into_lease();
        let guard = LeaseGuard {
            scheduler: self,
            lease: Some(lease.clone()),
        };

        if let Some(spacing) = policy.cooldown {
            if let Some(ready_at) = self.cooldown_ready_at(job_key, spacing)? {
                debug!(%job_key, %ready_at, "job cooling down, skipping");
                guard.finish();
                return Ok(RunOutcome::Skipped(SkipReason::CoolingDown { ready_at }));
            }
        }

        match job(&lease) {
            Ok(value) => {
                let completed_at = self.record_completion(job_key);
                if guard.finish() == Some(ReleaseOutcome::NotHeld) {
                    warn!(%job_key, "job outlived its lease; another run may have overlapped");
                }
                let at = completed_at?;
                info!(%job_key, completed_at = %at, reclaimed, "job completed");
                Ok(RunOutcome::Completed { value, reclaimed })
            }
            Err(source) => {
                warn!(%job_key, error = %source, "job failed");
                guard.finish();
                Err(JobError::Failed {
                    job_key: job_key.clone(),
                    source,
                })
            }
        }
    }
}

/// Releases its lease when dropped, unless it was released explicitly.
struct LeaseGuard<'a, S: LeaseStore, C: Clock, Sl: Sleeper> {
    scheduler: &'a LeaseScheduler<S, C, Sl>,
    lease: Option<Lease>,
}

impl<S: LeaseStore, C: Clock, Sl: Sleeper> LeaseGuard<'_, S, C, Sl> {
    /// Release now. `None` if the release failed; the failure is logged and the lease
    /// stays until it expires.
    fn finish(mut self) -> Option<ReleaseOutcome> {
        self.release_logged()
    }

    fn release_logged(&mut self) -> Option<ReleaseOutcome> {
        let lease = self.lease.take()?;
        match self.scheduler.release(&lease) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    job_key = %lease.job_key,
                    lease_id = %lease.lease_id,
                    expires_at = %lease.expires_at(),
                    error = %err,
                    "failed to release lease, slot stays blocked until expiry"
                );
                None
            }
        }
    }
}

impl<S: LeaseStore, C: Clock, Sl: Sleeper> Drop for LeaseGuard<'_, S, C, Sl> {
    fn drop(&mut self) {
        self.release_logged();
    }
}
