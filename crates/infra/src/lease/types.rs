use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use regshard_core::{DomainError, JobKey, LeaseId};

use crate::backoff::Retryable;
use crate::config::{duration_secs, option_duration_secs};

/// A time-bounded claim on one job key.
///
/// A lease that outlives `max_duration` is expired: its holder is presumed dead and the
/// next acquirer may take the key over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_key: JobKey,
    pub lease_id: LeaseId,
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub max_duration: Duration,
}

impl Lease {
    pub fn new(job_key: JobKey, acquired_at: DateTime<Utc>, max_duration: Duration) -> Self {
        Self {
            job_key,
            lease_id: LeaseId::new(),
            acquired_at,
            max_duration,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.max_duration)
            .ok()
            .and_then(|d| self.acquired_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The key was free.
    Acquired(Lease),
    /// The key was held by an expired lease, which this acquisition replaced.
    Reclaimed { lease: Lease, previous: Lease },
}

impl AcquireOutcome {
    pub fn lease(&self) -> &Lease {
        match self {
            AcquireOutcome::Acquired(lease) | AcquireOutcome::Reclaimed { lease, .. } => lease,
        }
    }

    pub fn into_lease(self) -> Lease {
        match self {
            AcquireOutcome::Acquired(lease) | AcquireOutcome::Reclaimed { lease, .. } => lease,
        }
    }

    pub fn was_reclaimed(&self) -> bool {
        matches!(self, AcquireOutcome::Reclaimed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The lease had already been replaced or removed, usually because it expired and
    /// someone else reclaimed the key.
    NotHeld,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease for {job_key} is held by {holder} until {expires_at}")]
    AlreadyHeld {
        job_key: JobKey,
        holder: LeaseId,
        expires_at: DateTime<Utc>,
    },

    /// The lease store failed or kept losing compare-and-swap races.
    #[error("lease store failure: {0}")]
    Store(String),
}

impl Retryable for LeaseError {
    fn is_transient(&self) -> bool {
        matches!(self, LeaseError::Store(_))
    }
}

/// Per-job scheduling record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Longest a single run may hold the job's lease.
    #[serde(with = "duration_secs")]
    pub max_duration: Duration,

    /// Minimum spacing between the end of the last successful run and the next start.
    #[serde(default, with = "option_duration_secs")]
    pub cooldown: Option<Duration>,
}

impl JobPolicy {
    pub const fn new(max_duration: Duration) -> Self {
        Self {
            max_duration,
            cooldown: None,
        }
    }

    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.max_duration.is_zero() {
            return Err(DomainError::validation("lease max duration must be positive"));
        }
        if self.cooldown.is_some_and(|c| c.is_zero()) {
            return Err(DomainError::validation(
                "cooldown must be positive when set; omit it to disable",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expires_exactly_at_max_duration() {
        let now = Utc::now();
        let lease = Lease::new(JobKey::new("dns-publish").unwrap(), now, Duration::from_secs(180));

        assert_eq!(lease.expires_at(), now + chrono::Duration::minutes(3));
        assert!(!lease.is_expired_at(now + chrono::Duration::seconds(179)));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(180)));
    }

    #[test]
    fn huge_durations_do_not_overflow() {
        let lease = Lease::new(JobKey::new("forever").unwrap(), Utc::now(), Duration::MAX);
        assert_eq!(lease.expires_at(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn policy_validation() {
        assert!(JobPolicy::new(Duration::from_secs(60)).validate().is_ok());
        assert!(JobPolicy::new(Duration::ZERO).validate().is_err());
        assert!(
            JobPolicy::new(Duration::from_secs(60))
                .with_cooldown(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn policy_reads_durations_as_seconds() {
        let policy: JobPolicy =
            serde_json::from_str(r#"{"max_duration": 1800, "cooldown": 7200}"#).unwrap();
        assert_eq!(
            policy,
            JobPolicy::new(Duration::from_secs(1800)).with_cooldown(Duration::from_secs(7200))
        );

        let policy: JobPolicy = serde_json::from_str(r#"{"max_duration": 60}"#).unwrap();
        assert_eq!(policy.cooldown, None);
    }
}
