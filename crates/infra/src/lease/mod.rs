//! Lease scheduler for periodic batch jobs.
//!
//! ## Design
//!
//! - At most one live lease per job key; a lease that outlives its max duration is
//!   expired and the next acquirer reclaims it
//! - Expiry is lazy, checked on acquire; there is no background sweeper
//! - Cooldowns are tracked per job key from the last successful completion, independent
//!   of lease state
//! - The lease store's single-row compare-and-swap is the only mutual exclusion
//!
//! ## Components
//!
//! - `LeaseStore`: compare-and-swap persistence for leases and completion times
//! - `LeaseScheduler`: acquire/release/cooldown plus `run_exclusive`
//! - `PeriodicRunner`: background loop attempting registered jobs every poll interval

pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;

pub use runner::{JobBody, PeriodicRunner, RunnerConfig, RunnerHandle, RunnerStats, TickResult};
pub use scheduler::{JobError, LeaseScheduler, RunOutcome, SkipReason};
pub use store::{InMemoryLeaseStore, LeaseStore};
pub use types::{AcquireOutcome, JobPolicy, Lease, LeaseError, ReleaseOutcome};
