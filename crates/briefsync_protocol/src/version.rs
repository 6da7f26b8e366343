//! Logical references to points in the change-set history.

use serde::{Deserialize, Serialize};

/// A version of a repository, resolved once per operation into a
/// concrete `ChangeSetPosition`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionRef {
    /// Before the first change-set.
    First,
    /// The most recent change-set on the remote.
    Latest,
    /// The state right after the given change-set. An empty id is `First`.
    AsOfChangeSet(String),
    /// A named version (tag) registered on the remote.
    Named(String),
}

impl VersionRef {
    /// Shorthand for `AsOfChangeSet`.
    pub fn as_of(id: impl Into<String>) -> Self {
        VersionRef::AsOfChangeSet(id.into())
    }
}

impl Default for VersionRef {
    fn default() -> Self {
        VersionRef::Latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_is_the_default() {
        assert_eq!(VersionRef::default(), VersionRef::Latest);
        assert_eq!(VersionRef::as_of("abc"), VersionRef::AsOfChangeSet("abc".into()));
    }
}
