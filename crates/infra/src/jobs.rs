//! Commit-log batch jobs wired for the periodic runner.
//!
//! Both jobs are idempotent restartable units: the reaper's watermark is recomputed on
//! every run and the exporter resumes from its stored per-bucket watermarks.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use regshard_core::{Clock, DomainError, JobKey};

use crate::backoff::Sleeper;
use crate::commit_log::{CommitLog, CommitLogDiffExporter, CommitLogReaper, ExportSink, WatermarkStore};
use crate::config::{ConfigError, RegshardConfig};
use crate::lease::{Lease, LeaseStore, PeriodicRunner};

pub const REAP_JOB: &str = "commit-log-reap";
pub const EXPORT_JOB: &str = "commit-log-export";

/// Job body running one reap pass.
pub fn reap_job<L, C, S>(reaper: Arc<CommitLogReaper<L, C, S>>) -> impl Fn(&Lease) -> anyhow::Result<()> + Send + Sync + 'static
where
    L: CommitLog + 'static,
    C: Clock + 'static,
    S: Sleeper + 'static,
{
    move |lease| {
        let report = reaper.run()?;
        info!(job_key = %lease.job_key, deleted = report.total(), "reap pass done");
        Ok(())
    }
}

/// Job body exporting everything committed before the lease was taken.
pub fn export_job<L, W, S, K>(
    exporter: Arc<CommitLogDiffExporter<L, W, S>>,
    sink: Arc<Mutex<K>>,
) -> impl Fn(&Lease) -> anyhow::Result<()> + Send + Sync + 'static
where
    L: CommitLog + 'static,
    W: WatermarkStore + 'static,
    S: Sleeper + 'static,
    K: ExportSink + Send + 'static,
{
    move |lease| {
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let report = exporter.run(lease.acquired_at, &mut *sink)?;
        info!(job_key = %lease.job_key, exported = report.total(), "export pass done");
        Ok(())
    }
}

/// Register the reap and export jobs under their configured policies.
pub fn register_commit_log_jobs<St, C, L, Cr, Sr, W, Se, K>(
    runner: &mut PeriodicRunner<St, C>,
    config: &RegshardConfig,
    reaper: Arc<CommitLogReaper<L, Cr, Sr>>,
    exporter: Arc<CommitLogDiffExporter<L, W, Se>>,
    sink: Arc<Mutex<K>>,
) -> Result<(), ConfigError>
where
    St: LeaseStore + 'static,
    C: Clock + 'static,
    L: CommitLog + 'static,
    Cr: Clock + 'static,
    Sr: Sleeper + 'static,
    W: WatermarkStore + 'static,
    Se: Sleeper + 'static,
    K: ExportSink + Send + 'static,
{
    let policy = |name: &str| -> Result<_, ConfigError> {
        let key = JobKey::new(name)?;
        let policy = config
            .policy_for(&key)
            .ok_or_else(|| DomainError::validation(format!("no policy configured for {key}")))?;
        Ok((key, policy))
    };

    let (key, reap_policy) = policy(REAP_JOB)?;
    runner.register(key, reap_policy, reap_job(reaper));
    let (key, export_policy) = policy(EXPORT_JOB)?;
    runner.register(key, export_policy, export_job(exporter, sink));
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use regshard_core::{BucketId, ManualClock, ResourceKey};

    use super::*;
    use crate::backoff::Backoff;
    use crate::bucket::BucketLayout;
    use crate::commit_log::{InMemoryWatermarkStore, JsonLinesSink, MutationSet, TimeRange};
    use crate::datastore::InMemoryDatastore;
    use crate::lease::{InMemoryLeaseStore, LeaseScheduler, TickResult};

    #[test]
    fn registered_jobs_reap_and_export_under_leases() {
        let now = Utc::now();
        let clock = ManualClock::arc(now - ChronoDuration::days(40));
        let store = Arc::new(InMemoryDatastore::with_clock(
            BucketLayout::new(2, 2).unwrap(),
            clock.clone(),
        ));
        let old = MutationSet::new().upsert(ResourceKey::domain("old.tld").unwrap(), serde_json::json!({}));
        store.append(BucketId::new(0), &old).unwrap();
        clock.set(now - ChronoDuration::minutes(1));
        let fresh = MutationSet::new().upsert(ResourceKey::domain("fresh.tld").unwrap(), serde_json::json!({}));
        store.append(BucketId::new(1), &fresh).unwrap();
        clock.set(now);

        let config = RegshardConfig::default();
        let reaper = Arc::new(CommitLogReaper::with_parts(
            store.clone(),
            clock.clone(),
            Backoff::default(),
        ));
        let exporter = Arc::new(CommitLogDiffExporter::new(store.clone(), InMemoryWatermarkStore::new()));
        let sink = Arc::new(Mutex::new(JsonLinesSink::new(Vec::new())));

        let scheduler = Arc::new(LeaseScheduler::with_clock(InMemoryLeaseStore::new(), clock.clone()));
        let mut runner = PeriodicRunner::new(scheduler);
        register_commit_log_jobs(&mut runner, &config, reaper, exporter, sink.clone()).unwrap();

        let results = runner.tick_once();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, result)| matches!(result, TickResult::Completed { .. })));

        let remaining: usize = [0, 1]
            .into_iter()
            .map(|b| {
                store
                    .read_page(BucketId::new(b), 0, &TimeRange::all(), 10)
                    .unwrap()
                    .len()
            })
            .sum();
        assert_eq!(remaining, 1);
        assert_eq!(sink.lock().unwrap().written(), 1);

        clock.advance(ChronoDuration::seconds(1));
        runner.tick_once();
        assert_eq!(sink.lock().unwrap().written(), 1);
    }
}
