//! Strongly-typed identifiers used across the sharded store.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Shard identifier in `[0, bucket_count)`.
///
/// Commit-log buckets and resource-index buckets are separate address spaces that
/// happen to share this type; the owning component decides which count bounds it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(u32);

impl BucketId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for BucketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of a held lease (one per successful acquisition).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(LeaseId, "LeaseId");

/// Kind of registry resource tracked by the resource index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Domain,
    Contact,
    Host,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Domain => "domain",
            ResourceKind::Contact => "contact",
            ResourceKind::Host => "host",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "domain" => Ok(ResourceKind::Domain),
            "contact" => Ok(ResourceKind::Contact),
            "host" => Ok(ResourceKind::Host),
            other => Err(DomainError::invalid_id(format!("unknown resource kind '{other}'"))),
        }
    }
}

/// Key of a registry resource: its kind plus its repository identifier.
///
/// The textual form `kind/identifier` is what gets hashed for bucket assignment, so
/// it must never change for an existing resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    kind: ResourceKind,
    id: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::invalid_id("resource identifier must not be empty"));
        }
        if id.contains('/') {
            return Err(DomainError::invalid_id(format!(
                "resource identifier '{id}' must not contain '/'"
            )));
        }
        Ok(Self { kind, id })
    }

    pub fn domain(id: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(ResourceKind::Domain, id)
    }

    pub fn contact(id: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(ResourceKind::Contact, id)
    }

    pub fn host(id: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(ResourceKind::Host, id)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl core::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for ResourceKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| DomainError::invalid_id(format!("ResourceKey: missing '/' in '{s}'")))?;
        Self::new(kind.parse()?, id)
    }
}

/// Name of a periodic job protected by a lease (e.g. `dns-publish`, `rde-upload:example`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey(String);

impl JobKey {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::invalid_id("job key must not be empty"));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.' | ':'));
        if !valid {
            return Err(DomainError::invalid_id(format!(
                "job key '{name}' may only contain [a-z0-9-_.:]"
            )));
        }
        Ok(Self(name))
    }

    /// Job key scoped to a sub-resource, e.g. `rde-upload` + `example` → `rde-upload:example`.
    pub fn scoped(job: &str, scope: &str) -> Result<Self, DomainError> {
        Self::new(format!("{job}:{scope}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The job part of a scoped key (`rde-upload:example` → `rde-upload`).
    pub fn job(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(job, _)| job)
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobKey> for String {
    fn from(value: JobKey) -> Self {
        value.0
    }
}
