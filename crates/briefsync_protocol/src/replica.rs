//! Replica and repository identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a shared repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(Uuid);

impl RepositoryId {
    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generates a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its hyphenated form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Identifier of one replica (briefcase) of a repository.
///
/// Ids are issued by the remote authority from `[FIRST_VALID, LAST_VALID]`.
/// `STANDALONE` marks a replica that never pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(u32);

impl ReplicaId {
    /// Replica that is not tracked by the remote and cannot push.
    pub const STANDALONE: ReplicaId = ReplicaId(0);
    /// Lowest id the remote issues.
    pub const FIRST_VALID: ReplicaId = ReplicaId(2);
    /// Highest id the remote issues.
    pub const LAST_VALID: ReplicaId = ReplicaId(0x00ff_fffe);

    /// Wraps a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns true if the id lies in the issued range.
    pub fn is_valid(&self) -> bool {
        (Self::FIRST_VALID.0..=Self::LAST_VALID.0).contains(&self.0)
    }

    /// Returns true for the standalone sentinel.
    pub fn is_standalone(&self) -> bool {
        *self == Self::STANDALONE
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Mode a native replica handle is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
}

/// Identity header persisted inside a replica file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaHeader {
    /// Repository the replica belongs to.
    pub repository_id: RepositoryId,
    /// Replica id.
    pub replica_id: ReplicaId,
    /// Id of the last change-set applied going forward, empty if none.
    pub parent_change_set_id: String,
    /// Id of the change-set the visible content is reversed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_change_set_id: Option<String>,
}
