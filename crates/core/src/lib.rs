//! `regshard-core`: primitives shared by the sharded store and the lease scheduler.
//!
//! This crate contains **pure** building blocks (identifiers, clock, domain errors).
//! Storage and scheduling live in `regshard-infra`.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BucketId, JobKey, LeaseId, ResourceKey, ResourceKind};
