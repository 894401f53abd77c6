//! Deterministic bucket assignment.
//!
//! A key is hashed with SHA-256 and the first eight digest bytes, read big-endian,
//! are reduced modulo the bucket count. The mapping depends only on the key bytes and
//! the count, never on process state.
//!
//! Bucket counts may grow across deployments but never shrink. Growing a count does
//! not move existing rows: callers store the bucket they were assigned at creation and
//! read it back instead of re-deriving it.

use core::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use regshard_core::{BucketId, DomainError, ResourceKey};

/// Number of buckets in one bucket set (always at least one).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BucketCount(NonZeroU32);

impl BucketCount {
    /// Commit-log buckets for a fresh deployment.
    pub const DEFAULT_COMMIT_LOG: Self = Self::from_const(100);
    /// Resource-index buckets for a fresh deployment.
    pub const DEFAULT_RESOURCE_INDEX: Self = Self::from_const(997);

    const fn from_const(count: u32) -> Self {
        match NonZeroU32::new(count) {
            Some(count) => Self(count),
            None => panic!("bucket count must be at least 1"),
        }
    }

    pub fn new(count: u32) -> Result<Self, DomainError> {
        NonZeroU32::new(count)
            .map(Self)
            .ok_or_else(|| DomainError::validation("bucket count must be at least 1"))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn contains(self, bucket: BucketId) -> bool {
        bucket.get() < self.get()
    }

    /// Every bucket id in `[0, count)`, ascending.
    pub fn buckets(self) -> impl Iterator<Item = BucketId> {
        (0..self.get()).map(BucketId::new)
    }
}

impl TryFrom<u32> for BucketCount {
    type Error = DomainError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BucketCount> for u32 {
    fn from(value: BucketCount) -> Self {
        value.get()
    }
}

impl core::fmt::Display for BucketCount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Map arbitrary key bytes to a bucket in `[0, count)`.
pub fn bucket_for(key: &[u8], count: BucketCount) -> BucketId {
    let digest = Sha256::digest(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    BucketId::new((hash % u64::from(count.get())) as u32)
}

/// Bucket of a registry resource, hashed over its `kind/identifier` text.
pub fn resource_bucket(key: &ResourceKey, count: BucketCount) -> BucketId {
    bucket_for(key.to_string().as_bytes(), count)
}

/// The two independently sized bucket sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketSet {
    CommitLog,
    ResourceIndex,
}

impl core::fmt::Display for BucketSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BucketSet::CommitLog => f.write_str("commit log"),
            BucketSet::ResourceIndex => f.write_str("resource index"),
        }
    }
}

/// Bucket counts in force for one deployment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    pub commit_log: BucketCount,
    pub resource_index: BucketCount,
}

impl BucketLayout {
    pub fn new(commit_log: u32, resource_index: u32) -> Result<Self, DomainError> {
        Ok(Self {
            commit_log: BucketCount::new(commit_log)?,
            resource_index: BucketCount::new(resource_index)?,
        })
    }

    pub fn count(&self, set: BucketSet) -> BucketCount {
        match set {
            BucketSet::CommitLog => self.commit_log,
            BucketSet::ResourceIndex => self.resource_index,
        }
    }
}

/// Raised at startup when a configured count is below the persisted one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{set} bucket count may only grow: persisted {persisted}, configured {configured}")]
pub struct BucketCountDecreased {
    pub set: BucketSet,
    pub persisted: BucketCount,
    pub configured: BucketCount,
}

/// Reject a layout that would shrink either bucket set.
pub fn check_growth(
    persisted: Option<&BucketLayout>,
    configured: &BucketLayout,
) -> Result<(), BucketCountDecreased> {
    let Some(persisted) = persisted else {
        return Ok(());
    };
    for set in [BucketSet::CommitLog, BucketSet::ResourceIndex] {
        if configured.count(set) < persisted.count(set) {
            return Err(BucketCountDecreased {
                set,
                persisted: persisted.count(set),
                configured: configured.count(set),
            });
        }
    }
    Ok(())
}
