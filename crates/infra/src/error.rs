//! Store failure kinds shared by the commit log, the resource index and the datastore.

use thiserror::Error;

use regshard_core::{BucketId, DomainError};

use crate::backoff::Retryable;

/// Failure raised by a partition-local store operation.
///
/// Every variant leaves the partition untouched: an operation either commits all of
/// its rows or none of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network blip, contention, timeout. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Malformed data, serialization fault, invalid addressing. Never retried.
    #[error("permanent store failure: {0}")]
    Permanent(String),

    /// A persisted commit-log entry failed its checksum or length check.
    #[error("corrupt commit log entry (bucket {bucket}, transaction {transaction_id}): {reason}")]
    Corrupt {
        bucket: BucketId,
        transaction_id: u64,
        reason: String,
    },
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Permanent(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Permanent(format!("serialization failed: {value}"))
    }
}
