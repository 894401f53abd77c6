//! Process configuration.
//!
//! Read once at startup (defaults overridden by `REGSHARD_*` environment variables),
//! validated, then shared immutably. Nothing here is reloaded at runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use regshard_core::{DomainError, JobKey};

use crate::backoff::RetryPolicy;
use crate::bucket::{BucketCount, BucketCountDecreased, BucketLayout, check_growth};
use crate::commit_log::export::DEFAULT_EXPORT_BATCH_SIZE;
use crate::commit_log::reaper::{DEFAULT_REAP_BATCH_SIZE, DEFAULT_RETENTION};
use crate::lease::JobPolicy;
use crate::resource_index::AsyncDeleteDelay;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{var} is not valid JSON: {source}")]
    Json {
        var: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    BucketCount(#[from] BucketCountDecreased),
}

/// Runtime configuration for the sharded store and the lease scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegshardConfig {
    /// May be raised between deployments, never lowered.
    pub commit_log_buckets: BucketCount,
    /// May be raised between deployments, never lowered.
    pub resource_index_buckets: BucketCount,

    #[serde(with = "duration_secs")]
    pub commit_log_retention: Duration,
    pub export_batch_size: usize,
    pub reap_batch_size: usize,

    pub retry_max_attempts: u32,
    /// One backoff time unit; the wait before attempt `n` is `(2^n - 2)` units.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,

    #[serde(with = "duration_secs")]
    pub async_delete_delay: Duration,
    /// Upper bound on any single store transaction.
    #[serde(with = "duration_secs")]
    pub max_transaction_duration: Duration,
    /// How long a cached index or resource read may be served; zero when caching is off.
    #[serde(with = "duration_secs")]
    pub index_cache_duration: Duration,

    #[serde(with = "duration_secs")]
    pub runner_poll_interval: Duration,

    /// Keyed by job name (`rde-upload`) or by full scoped key (`rde-upload:example`).
    pub job_policies: BTreeMap<String, JobPolicy>,
}

impl Default for RegshardConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let async_delete = AsyncDeleteDelay::default();
        Self {
            commit_log_buckets: BucketCount::DEFAULT_COMMIT_LOG,
            resource_index_buckets: BucketCount::DEFAULT_RESOURCE_INDEX,
            commit_log_retention: DEFAULT_RETENTION,
            export_batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            reap_batch_size: DEFAULT_REAP_BATCH_SIZE,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay: retry.unit,
            async_delete_delay: async_delete.delay(),
            max_transaction_duration: Duration::from_secs(60),
            index_cache_duration: Duration::ZERO,
            runner_poll_interval: Duration::from_secs(MINUTE),
            job_policies: default_job_policies(),
        }
    }
}

/// Built-in per-job records.
pub fn default_job_policies() -> BTreeMap<String, JobPolicy> {
    [
        ("dns-publish", JobPolicy::new(Duration::from_secs(3 * MINUTE))),
        ("commit-log-reap", JobPolicy::new(Duration::from_secs(5 * MINUTE))),
        ("commit-log-export", JobPolicy::new(Duration::from_secs(5 * MINUTE))),
        ("rde-staging", JobPolicy::new(Duration::from_secs(2 * HOUR))),
        (
            "rde-upload",
            JobPolicy::new(Duration::from_secs(30 * MINUTE)).with_cooldown(Duration::from_secs(2 * HOUR)),
        ),
        ("rde-report", JobPolicy::new(Duration::from_secs(MINUTE))),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}

impl RegshardConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `REGSHARD_*` name.
    ///
    /// `REGSHARD_JOB_POLICIES` holds a JSON object of policies merged over the
    /// built-in ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse::<u32>(&lookup, "REGSHARD_COMMIT_LOG_BUCKETS")? {
            config.commit_log_buckets = BucketCount::new(n)?;
        }
        if let Some(n) = parse::<u32>(&lookup, "REGSHARD_RESOURCE_INDEX_BUCKETS")? {
            config.resource_index_buckets = BucketCount::new(n)?;
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGSHARD_COMMIT_LOG_RETENTION_SECS")? {
            config.commit_log_retention = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "REGSHARD_EXPORT_BATCH_SIZE")? {
            config.export_batch_size = n;
        }
        if let Some(n) = parse(&lookup, "REGSHARD_REAP_BATCH_SIZE")? {
            config.reap_batch_size = n;
        }
        if let Some(n) = parse(&lookup, "REGSHARD_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "REGSHARD_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGSHARD_ASYNC_DELETE_DELAY_SECS")? {
            config.async_delete_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGSHARD_MAX_TRANSACTION_SECS")? {
            config.max_transaction_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGSHARD_INDEX_CACHE_SECS")? {
            config.index_cache_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGSHARD_RUNNER_POLL_SECS")? {
            config.runner_poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("REGSHARD_JOB_POLICIES") {
            let overrides: BTreeMap<String, JobPolicy> =
                serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                    var: "REGSHARD_JOB_POLICIES".to_string(),
                    source,
                })?;
            config.job_policies.extend(overrides);
        }

        Ok(config)
    }

    /// Check every knob once, at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_log_retention.is_zero() {
            return Err(DomainError::validation("commit log retention must be positive").into());
        }
        if self.export_batch_size == 0 || self.reap_batch_size == 0 {
            return Err(DomainError::validation("batch sizes must be positive").into());
        }
        if self.retry_max_attempts == 0 {
            return Err(DomainError::validation("retry_max_attempts must be at least 1").into());
        }
        if self.runner_poll_interval.is_zero() {
            return Err(DomainError::validation("runner poll interval must be positive").into());
        }
        self.async_delete()?;
        for (name, policy) in &self.job_policies {
            JobKey::new(name.as_str())?;
            policy
                .validate()
                .map_err(|e| DomainError::validation(format!("job policy {name}: {e}")))?;
        }
        Ok(())
    }

    /// Reject a configuration whose bucket counts are below the persisted ones.
    pub fn check_layout(&self, persisted: Option<&BucketLayout>) -> Result<(), ConfigError> {
        check_growth(persisted, &self.layout())?;
        Ok(())
    }

    pub fn layout(&self) -> BucketLayout {
        BucketLayout {
            commit_log: self.commit_log_buckets,
            resource_index: self.resource_index_buckets,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_base_delay)
    }

    pub fn async_delete(&self) -> Result<AsyncDeleteDelay, DomainError> {
        AsyncDeleteDelay::new(
            self.async_delete_delay,
            self.max_transaction_duration,
            self.index_cache_duration,
        )
    }

    /// Policy for `job_key`: an exact match first, then its job name.
    pub fn policy_for(&self, job_key: &JobKey) -> Option<JobPolicy> {
        self.job_policies
            .get(job_key.as_str())
            .or_else(|| self.job_policies.get(job_key.job()))
            .copied()
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        })
}

/// Serde helpers: `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helpers: `Option<Duration>` as whole seconds or null.
pub mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}

/// Serde helpers: `Duration` as whole milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RegshardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.commit_log_retention, Duration::from_secs(30 * 24 * HOUR));
        assert_eq!(config.export_batch_size, 100);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = RegshardConfig::from_lookup(lookup(&[
            ("REGSHARD_COMMIT_LOG_BUCKETS", "128"),
            ("REGSHARD_RETRY_BASE_DELAY_MS", " 5 "),
            (
                "REGSHARD_JOB_POLICIES",
                r#"{"rde-upload:slow": {"max_duration": 3600, "cooldown": 14400}}"#,
            ),
        ]))
        .unwrap();

        assert_eq!(config.commit_log_buckets.get(), 128);
        assert_eq!(config.retry_base_delay, Duration::from_millis(5));
        config.validate().unwrap();

        let slow = config.policy_for(&JobKey::new("rde-upload:slow").unwrap()).unwrap();
        assert_eq!(slow.max_duration, Duration::from_secs(HOUR));
        let other = config.policy_for(&JobKey::new("rde-upload:example").unwrap()).unwrap();
        assert_eq!(other.cooldown, Some(Duration::from_secs(2 * HOUR)));
        assert_eq!(config.policy_for(&JobKey::new("unknown").unwrap()), None);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = RegshardConfig::from_lookup(lookup(&[("REGSHARD_REAP_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "REGSHARD_REAP_BATCH_SIZE"));

        let err = RegshardConfig::from_lookup(lookup(&[("REGSHARD_RESOURCE_INDEX_BUCKETS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = RegshardConfig::from_lookup(lookup(&[("REGSHARD_JOB_POLICIES", "{")])).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn async_delete_delay_must_cover_transactions_and_cache() {
        let config = RegshardConfig::from_lookup(lookup(&[("REGSHARD_INDEX_CACHE_SECS", "60")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bucket_counts_may_not_shrink() {
        let config = RegshardConfig::from_lookup(lookup(&[("REGSHARD_COMMIT_LOG_BUCKETS", "50")])).unwrap();
        let persisted = RegshardConfig::default().layout();
        assert!(matches!(
            config.check_layout(Some(&persisted)),
            Err(ConfigError::BucketCount(_))
        ));
        assert!(RegshardConfig::default().check_layout(Some(&persisted)).is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let config = RegshardConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RegshardConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: RegshardConfig = serde_json::from_str(r#"{"reap_batch_size": 7}"#).unwrap();
        assert_eq!(partial.reap_batch_size, 7);
        assert_eq!(partial.job_policies, default_job_policies());
    }
}
