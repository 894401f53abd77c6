//! Sharded consistency and scheduling layer: bucketed commit log and resource index
//! over a partition-transactional store, plus leases for periodic batch jobs.

pub mod backoff;
pub mod bucket;
pub mod commit_log;
pub mod config;
pub mod datastore;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod resource_index;
pub mod writer;

#[cfg(test)]
mod integration_tests;

pub use backoff::{Backoff, RetryError, RetryPolicy, Retryable};
pub use bucket::{BucketCount, BucketLayout, bucket_for, resource_bucket};
pub use config::{ConfigError, RegshardConfig};
pub use datastore::{InMemoryDatastore, PartitionStore};
pub use error::StoreError;
pub use writer::ShardedWriter;
