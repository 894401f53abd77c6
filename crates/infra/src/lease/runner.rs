//! Periodic job runner.
//!
//! Every poll interval the runner walks its registered jobs and attempts each one under
//! [`LeaseScheduler::run_exclusive`]. A job that is already running elsewhere, or still
//! cooling down, is skipped for this cycle; it is not an error. A job that fails or
//! panics is reported for that cycle and the remaining jobs still run.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use regshard_core::{Clock, JobKey};

use super::scheduler::{JobError, LeaseScheduler, RunOutcome, SkipReason};
use super::store::LeaseStore;
use super::types::{JobPolicy, Lease};

/// Job body: an idempotent, restartable unit of work.
pub type JobBody = Box<dyn Fn(&Lease) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often to attempt the registered jobs
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            name: "periodic-runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Runner statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub cycles: u64,
    pub completed: u64,
    pub reclaimed: u64,
    pub skipped_held: u64,
    pub skipped_cooldown: u64,
    pub failed: u64,
    pub uptime_secs: u64,
}

/// What happened to one job in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TickResult {
    Completed { reclaimed: bool },
    Skipped(SkipReason),
    Failed { error: String },
}

struct RegisteredJob {
    key: JobKey,
    policy: JobPolicy,
    body: JobBody,
}

/// Handle to a running [`PeriodicRunner`].
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl RunnerHandle {
    /// Request graceful shutdown and wait for the current cycle to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if let Err(payload) = j.join() {
                error!(panic = panic_message(payload.as_ref()), "periodic runner thread panicked");
            }
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct PeriodicRunner<S, C> {
    scheduler: Arc<LeaseScheduler<S, C>>,
    jobs: Vec<RegisteredJob>,
}

impl<S, C> std::fmt::Debug for PeriodicRunner<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicRunner")
            .field("jobs", &self.jobs.iter().map(|j| j.key.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl<S, C> PeriodicRunner<S, C>
where
    S: LeaseStore + 'static,
    C: Clock + 'static,
{
    pub fn new(scheduler: Arc<LeaseScheduler<S, C>>) -> Self {
        Self {
            scheduler,
            jobs: Vec::new(),
        }
    }

    /// Register a job. Jobs run in registration order within a cycle.
    pub fn register<F>(&mut self, key: JobKey, policy: JobPolicy, body: F)
    where
        F: Fn(&Lease) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.jobs.push(RegisteredJob {
            key,
            policy,
            body: Box::new(body),
        });
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobKey> {
        self.jobs.iter().map(|j| &j.key)
    }

    /// Attempt every registered job once.
    pub fn tick_once(&self) -> Vec<(JobKey, TickResult)> {
        self.jobs
            .iter()
            .map(|job| {
                // the lease guard releases while unwinding
                let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.scheduler
                        .run_exclusive(&job.key, &job.policy, |lease| (job.body)(lease))
                }));
                let result = match attempt {
                    Ok(Ok(RunOutcome::Completed { reclaimed, .. })) => TickResult::Completed { reclaimed },
                    Ok(Ok(RunOutcome::Skipped(reason))) => TickResult::Skipped(reason),
                    Ok(Err(JobError::Failed { source, .. })) => TickResult::Failed {
                        error: format!("{source:#}"),
                    },
                    Ok(Err(JobError::Lease(err))) => TickResult::Failed {
                        error: err.to_string(),
                    },
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(job_key = %job.key, panic = message, "job panicked");
                        TickResult::Failed {
                            error: format!("job panicked: {message}"),
                        }
                    }
                };
                (job.key.clone(), result)
            })
            .collect()
    }

    /// Spawn the runner on a background thread.
    pub fn spawn(self, config: RunnerConfig) -> io::Result<RunnerHandle>
    where
        S: Send + Sync,
        C: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RunnerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || runner_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(RunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn runner_loop<S, C>(
    runner: PeriodicRunner<S, C>,
    config: RunnerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) where
    S: LeaseStore + 'static,
    C: Clock + 'static,
{
    info!(runner = %config.name, jobs = runner.jobs.len(), "periodic runner started");
    let start_time = Instant::now();

    loop {
        let results = runner.tick_once();

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.cycles += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            for (_, result) in &results {
                match result {
                    TickResult::Completed { reclaimed } => {
                        s.completed += 1;
                        if *reclaimed {
                            s.reclaimed += 1;
                        }
                    }
                    TickResult::Skipped(SkipReason::AlreadyHeld { .. }) => s.skipped_held += 1,
                    TickResult::Skipped(SkipReason::CoolingDown { .. }) => s.skipped_cooldown += 1,
                    TickResult::Failed { .. } => s.failed += 1,
                }
            }
        }

        for (job_key, result) in &results {
            match result {
                TickResult::Failed { error } => {
                    warn!(runner = %config.name, %job_key, error = %error, "job attempt failed");
                }
                other => debug!(runner = %config.name, %job_key, result = ?other, "job attempt"),
            }
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    info!(runner = %config.name, "periodic runner stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration as ChronoDuration, Utc};
    use regshard_core::ManualClock;

    use super::*;
    use crate::lease::InMemoryLeaseStore;

    fn key(name: &str) -> JobKey {
        JobKey::new(name).unwrap()
    }

    #[test]
    fn tick_runs_each_job_and_respects_cooldowns() {
        let clock = ManualClock::arc(Utc::now());
        let scheduler = Arc::new(LeaseScheduler::with_clock(InMemoryLeaseStore::new(), clock.clone()));
        let uploads = Arc::new(AtomicUsize::new(0));

        let mut runner = PeriodicRunner::new(scheduler);
        let counter = uploads.clone();
        runner.register(
            key("rde-upload:example"),
            JobPolicy::new(Duration::from_secs(1800)).with_cooldown(Duration::from_secs(7200)),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        runner.register(key("dns-publish"), JobPolicy::new(Duration::from_secs(180)), |_| {
            anyhow::bail!("dns writer unavailable")
        });

        let first = runner.tick_once();
        assert_eq!(first[0].1, TickResult::Completed { reclaimed: false });
        assert!(matches!(&first[1].1, TickResult::Failed { error } if error.contains("unavailable")));

        let second = runner.tick_once();
        assert!(matches!(
            second[0].1,
            TickResult::Skipped(SkipReason::CoolingDown { .. })
        ));

        clock.advance(ChronoDuration::hours(2));
        runner.tick_once();
        assert_eq!(uploads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spawned_runner_counts_cycles_and_shuts_down() {
        let scheduler = Arc::new(LeaseScheduler::new(InMemoryLeaseStore::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut runner = PeriodicRunner::new(scheduler.clone());
        let counter = runs.clone();
        runner.register(key("commit-log-reap"), JobPolicy::new(Duration::from_secs(300)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handle = runner
            .spawn(
                RunnerConfig::default()
                    .with_name("test-runner")
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();
        while handle.stats().cycles < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert!(stats.completed >= 3);
        assert_eq!(stats.failed, 0);
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(scheduler.store().load(&key("commit-log-reap")).unwrap(), None);
    }

    #[test]
    fn panicking_job_is_reported_as_failed() {
        let scheduler = Arc::new(LeaseScheduler::new(InMemoryLeaseStore::new()));
        let mut runner = PeriodicRunner::new(scheduler.clone());
        runner.register(key("rde-staging"), JobPolicy::new(Duration::from_secs(600)), |_| {
            panic!("staging directory vanished")
        });
        runner.register(key("dns-publish"), JobPolicy::new(Duration::from_secs(180)), |_| Ok(()));

        let results = runner.tick_once();
        assert!(matches!(
            &results[0].1,
            TickResult::Failed { error } if error == "job panicked: staging directory vanished"
        ));
        assert_eq!(results[1].1, TickResult::Completed { reclaimed: false });
        assert_eq!(scheduler.store().load(&key("rde-staging")).unwrap(), None);
    }

    #[test]
    fn spawned_runner_survives_failing_and_panicking_jobs() {
        let scheduler = Arc::new(LeaseScheduler::new(InMemoryLeaseStore::new()));
        let reaps = Arc::new(AtomicUsize::new(0));

        let mut runner = PeriodicRunner::new(scheduler.clone());
        runner.register(key("dns-publish"), JobPolicy::new(Duration::from_secs(180)), |_| {
            panic!("zone file truncated")
        });
        runner.register(key("rde-upload:example"), JobPolicy::new(Duration::from_secs(1800)), |_| {
            anyhow::bail!("sftp refused")
        });
        let counter = reaps.clone();
        runner.register(key("commit-log-reap"), JobPolicy::new(Duration::from_secs(300)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handle = runner
            .spawn(
                RunnerConfig::default()
                    .with_name("failing-runner")
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().cycles < 3 {
            assert!(Instant::now() < deadline, "runner stopped cycling: {:?}", handle.stats());
            thread::sleep(Duration::from_millis(1));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert!(stats.failed >= 6, "{stats:?}");
        assert!(stats.completed >= 3, "{stats:?}");
        assert!(reaps.load(Ordering::SeqCst) >= 3);
        for job in ["dns-publish", "rde-upload:example", "commit-log-reap"] {
            assert_eq!(scheduler.store().load(&key(job)).unwrap(), None);
        }
    }
}
