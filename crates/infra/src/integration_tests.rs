//! End-to-end tests across the write path, scans and leases.
//!
//! Tests: writer → datastore (commit log + index) → per-bucket scans → lease-guarded jobs
//!
//! Verifies:
//! - One resource's transactions land in one bucket, in order
//! - Multi-resource writes surface "first committed, second pending"
//! - Registry-wide fan-out scans see every resource exactly once, across growth
//! - Leases keep concurrent workers from overlapping

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use regshard_core::{BucketId, JobKey, ManualClock, ResourceKey};

    use crate::backoff::{Backoff, RetryError, RetryPolicy};
    use crate::commit_log::{CommitLog, MutationSet, ScanCursor, TimeRange};
    use crate::config::RegshardConfig;
    use crate::datastore::{InMemoryDatastore, PartitionStore};
    use crate::error::StoreError;
    use crate::lease::{InMemoryLeaseStore, JobPolicy, LeaseScheduler, RunOutcome, SkipReason};
    use crate::resource_index::{BucketFanOut, ResourceIndex};
    use crate::writer::ShardedWriter;

    fn test_config() -> RegshardConfig {
        let config = RegshardConfig::from_lookup(|var| match var {
            "REGSHARD_COMMIT_LOG_BUCKETS" => Some("8".to_string()),
            "REGSHARD_RESOURCE_INDEX_BUCKETS" => Some("4".to_string()),
            "REGSHARD_RETRY_BASE_DELAY_MS" => Some("0".to_string()),
            _ => None,
        })
        .unwrap();
        config.validate().unwrap();
        config
    }

    fn setup() -> ShardedWriter<Arc<InMemoryDatastore>> {
        regshard_observability::init();
        let config = test_config();
        let store = Arc::new(InMemoryDatastore::new(config.layout()));
        ShardedWriter::with_backoff(store, Backoff::new(config.retry_policy()))
    }

    fn domain(name: &str) -> ResourceKey {
        ResourceKey::domain(name).unwrap()
    }

    fn version(name: &str, n: u32) -> MutationSet {
        MutationSet::new().upsert(domain(name), serde_json::json!({"name": name, "version": n}))
    }

    #[test]
    fn one_resource_five_transactions_one_bucket_in_order() {
        let writer = setup();
        let key = domain("example.tld");

        let receipts: Vec<_> = (1..=5)
            .map(|n| writer.record(&key, version("example.tld", n)).unwrap())
            .collect();

        let bucket = writer.log_bucket(&key);
        assert!(receipts.iter().all(|r| r.entry.bucket == bucket));
        assert!(receipts
            .windows(2)
            .all(|w| w[0].entry.transaction_id < w[1].entry.transaction_id));

        let scanned: Vec<_> = writer
            .store()
            .scan_range(bucket, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(scanned.len(), 5);
        for (n, entry) in scanned.iter().enumerate() {
            assert_eq!(entry, &receipts[n].entry);
            assert_eq!(entry.mutations().unwrap(), version("example.tld", n as u32 + 1));
        }

        let indexed = writer.store().get(&key).unwrap().unwrap();
        assert_eq!(indexed.latest, Some(receipts[4].entry.position()));
    }

    #[test]
    fn cross_bucket_write_is_first_committed_second_pending() {
        let writer = setup();

        // two resources whose transactions land in different commit-log buckets
        let first = domain("first.tld");
        let second = (0..)
            .map(|i| domain(&format!("second-{i}.tld")))
            .find(|k| writer.log_bucket(k) != writer.log_bucket(&first))
            .unwrap();

        let mut yielded = 0;
        let changes = vec![
            (first.clone(), MutationSet::new().upsert(first.clone(), serde_json::json!({"ns": "second"}))),
            (second.clone(), MutationSet::new().upsert(second.clone(), serde_json::json!({"superordinate": "first"}))),
        ];
        let outcome = writer.record_each(changes.clone().into_iter().inspect(|_| {
            yielded += 1;
            if yielded == 2 {
                writer
                    .store()
                    .inject_fault(StoreError::permanent("second partition unavailable"));
            }
        }));

        assert_eq!(outcome.committed.len(), 1);
        assert!(matches!(
            outcome.failed,
            Some((ref key, RetryError::Aborted(StoreError::Permanent(_)))) if *key == second
        ));

        // a consumer must tolerate seeing the first resource without the second
        assert!(writer.store().get(&first).unwrap().is_some());
        assert!(writer.store().get(&second).unwrap().is_none());
        let pending_bucket = writer
            .store()
            .read_page(writer.log_bucket(&second), 0, &TimeRange::all(), 10)
            .unwrap();
        assert!(pending_bucket.is_empty());

        // retrying only the failed half converges
        let (key, mutations) = changes[1].clone();
        writer.record(&key, mutations).unwrap();
        assert!(writer.store().get(&second).unwrap().is_some());
    }

    #[test]
    fn transient_faults_are_absorbed_by_backoff() {
        let writer = setup();
        writer.store().inject_transient_failures(5);

        let receipt = writer.record(&domain("busy.tld"), version("busy.tld", 1)).unwrap();
        assert_eq!(receipt.entry.transaction_id, 1);

        let limited = ShardedWriter::with_backoff(
            writer.store().clone(),
            Backoff::new(RetryPolicy::new(3, Duration::ZERO)),
        );
        writer.store().inject_transient_failures(3);
        let err = limited
            .record(&domain("busy.tld"), version("busy.tld", 2))
            .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert!(matches!(err.into_inner(), StoreError::Transient(_)));
    }

    #[test]
    fn fan_out_sees_every_resource_once_across_growth() {
        let config = test_config();
        let store = InMemoryDatastore::new(config.layout());
        for i in 0..300 {
            let key = ResourceKey::host(format!("ns{i}.example.tld")).unwrap();
            store
                .commit(&crate::datastore::CommitRequest {
                    key: key.clone(),
                    log_bucket: BucketId::new(0),
                    mutations: MutationSet::new().upsert(key, serde_json::json!({})),
                })
                .unwrap();
        }

        let grown = RegshardConfig {
            resource_index_buckets: crate::bucket::BucketCount::new(32).unwrap(),
            ..config.clone()
        };
        grown.check_layout(Some(&config.layout())).unwrap();
        let store = store.reopen(grown.layout()).unwrap();
        for i in 300..400 {
            store
                .upsert(&ResourceKey::host(format!("ns{i}.example.tld")).unwrap())
                .unwrap();
        }

        let seen = Mutex::new(Vec::new());
        let report = BucketFanOut::new("index-scan").scan_index(&store, |entry| {
            assert!(store.index_buckets().contains(entry.bucket));
            seen.lock().unwrap().push(entry.key.clone());
            Ok(())
        });
        assert_eq!(report.summary().buckets, 32);
        assert!(report.is_complete());

        let mut seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 400);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn restarted_log_scan_resumes_after_its_cursor() {
        let writer = setup();
        let key = domain("resume.tld");
        for n in 1..=6 {
            writer.record(&key, version("resume.tld", n)).unwrap();
        }
        let bucket = writer.log_bucket(&key);

        let mut scan = writer
            .store()
            .scan_from(ScanCursor::start(bucket), TimeRange::all())
            .with_page_size(2);
        let head: Vec<u64> = scan.by_ref().take(3).map(|e| e.unwrap().transaction_id).collect();
        let cursor = scan.cursor();
        drop(scan);

        let tail: Vec<u64> = writer
            .store()
            .scan_from(cursor, TimeRange::all())
            .map(|e| e.unwrap().transaction_id)
            .collect();
        assert_eq!(head, vec![1, 2, 3]);
        assert_eq!(tail, vec![4, 5, 6]);
    }

    #[test]
    fn concurrent_workers_never_overlap() {
        let clock = ManualClock::arc(Utc::now());
        let scheduler = Arc::new(LeaseScheduler::with_clock(InMemoryLeaseStore::new(), clock.clone()));
        let policy = JobPolicy::new(Duration::from_secs(180));
        let job = JobKey::new("dns-publish").unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(6));
        let release = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (scheduler, job, running, ran, start, release) = (
                    scheduler.clone(),
                    job.clone(),
                    running.clone(),
                    ran.clone(),
                    start.clone(),
                    release.clone(),
                );
                std::thread::spawn(move || {
                    start.wait();
                    let outcome = scheduler.run_exclusive(&job, &policy, |_| {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        ran.fetch_add(1, Ordering::SeqCst);
                        release.wait();
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    });
                    if !matches!(outcome, Ok(RunOutcome::Completed { .. })) {
                        release.wait();
                    }
                    outcome.unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, RunOutcome::Skipped(SkipReason::AlreadyHeld { .. })))
                .count(),
            5
        );

        // a dead holder's lease is reclaimed once it expires
        let _stale = scheduler.acquire(&job, policy.max_duration).unwrap();
        clock.advance(ChronoDuration::minutes(3));
        let outcome = scheduler.run_exclusive(&job, &policy, |_| Ok(())).unwrap();
        assert_eq!(outcome, RunOutcome::Completed { value: (), reclaimed: true });
    }
}
