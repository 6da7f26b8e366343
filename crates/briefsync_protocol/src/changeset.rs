//! Change-set records and tokens.

use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Kind of content carried by a change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSetType {
    /// Data changes only.
    #[default]
    Regular,
    /// Carries schema (structural) changes, possibly alongside data.
    Schema,
}

impl ChangeSetType {
    /// Returns true for schema-bearing change-sets.
    pub fn is_schema(&self) -> bool {
        matches!(self, ChangeSetType::Schema)
    }
}

/// An immutable change-set in a repository's linear history.
///
/// `index` is assigned by the remote authority and is the only field used
/// for ordering. The first change-set of a repository has index 1; index 0
/// denotes the position before any change-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Change-set id (content hash).
    pub id: String,
    /// Id of the previous change-set, empty for the first one.
    pub parent_id: String,
    /// Ordinal position in the history.
    pub index: u64,
    /// Content kind.
    pub change_type: ChangeSetType,
    /// Size of the change-set file in bytes.
    pub file_size: u64,
    /// Free-form description supplied by the pusher.
    pub description: String,
    /// Time the change-set was accepted by the remote (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_date: Option<String>,
    /// Replica that pushed the change-set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<ReplicaId>,
}

impl ChangeSet {
    /// File name used for this change-set in the local cache.
    pub fn file_name(&self) -> String {
        format!("{}.cs", self.id)
    }

    /// Returns this change-set's position.
    pub fn position(&self) -> ChangeSetPosition {
        ChangeSetPosition::new(self.id.clone(), self.index)
    }

    /// Builds the applier token for this change-set stored under `dir`.
    pub fn to_token(&self, dir: &Path) -> ChangeSetToken {
        ChangeSetToken {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            index: self.index,
            pathname: dir.join(self.file_name()),
            change_type: self.change_type,
            push_date: self.push_date.clone(),
        }
    }
}

/// Identity and location of a downloaded change-set, handed to the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetToken {
    /// Change-set id.
    pub id: String,
    /// Parent change-set id.
    pub parent_id: String,
    /// Ordinal position.
    pub index: u64,
    /// Local file holding the change-set.
    pub pathname: PathBuf,
    /// Content kind.
    pub change_type: ChangeSetType,
    /// Push date, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_date: Option<String>,
}

/// A resolved point in the history: a change-set id and its index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChangeSetPosition {
    /// Change-set id, empty before the first change-set.
    pub id: String,
    /// Index of the change-set, 0 before the first change-set.
    pub index: u64,
}

impl ChangeSetPosition {
    /// Creates a position.
    pub fn new(id: impl Into<String>, index: u64) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }

    /// The position before the first change-set.
    pub fn initial() -> Self {
        Self::default()
    }

    /// Returns true for the position before the first change-set.
    pub fn is_initial(&self) -> bool {
        self.id.is_empty()
    }
}

impl std::fmt::Display for ChangeSetPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_initial() {
            write!(f, "#0 (initial)")
        } else {
            write!(f, "#{} ({})", self.index, self.id)
        }
    }
}
