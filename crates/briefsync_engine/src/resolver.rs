//! Resolution of version references to concrete positions.

use crate::error::{SyncError, SyncResult};
use crate::remote::{ChangeSetQuery, RemoteRepository};
use briefsync_protocol::{
    ChangeSetPosition, ReplicaHeader, ReplicaPosition, RepositoryId, VersionRef,
};
use tracing::debug;

/// Maps `VersionRef`s and stored change-set ids to `(id, index)` pairs.
pub struct VersionResolver<'a, R: RemoteRepository> {
    remote: &'a R,
}

impl<'a, R: RemoteRepository> VersionResolver<'a, R> {
    /// Creates a resolver over `remote`.
    pub fn new(remote: &'a R) -> Self {
        Self { remote }
    }

    /// Resolves a version reference.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if an explicit id or name is unknown remotely.
    pub async fn resolve(
        &self,
        repository: RepositoryId,
        version: &VersionRef,
    ) -> SyncResult<ChangeSetPosition> {
        let position = match version {
            VersionRef::First => ChangeSetPosition::initial(),
            VersionRef::Latest => {
                let latest = self
                    .remote
                    .list_change_sets(repository, &ChangeSetQuery::Latest)
                    .await?;
                latest
                    .last()
                    .map(|cs| cs.position())
                    .unwrap_or_else(ChangeSetPosition::initial)
            }
            VersionRef::AsOfChangeSet(id) => self.position_of(repository, id).await?,
            VersionRef::Named(name) => {
                let id = self.remote.named_version(repository, name).await?;
                self.position_of(repository, &id).await?
            }
        };
        debug!(repository = %repository, ?version, %position, "resolved version");
        Ok(position)
    }

    /// Resolves a change-set id. The empty id is the initial position and is
    /// answered without a remote call.
    pub async fn position_of(
        &self,
        repository: RepositoryId,
        id: &str,
    ) -> SyncResult<ChangeSetPosition> {
        if id.is_empty() {
            return Ok(ChangeSetPosition::initial());
        }
        let found = self
            .remote
            .list_change_sets(repository, &ChangeSetQuery::ById(id.to_string()))
            .await?;
        found
            .into_iter()
            .find(|cs| cs.id == id)
            .map(|cs| cs.position())
            .ok_or_else(|| SyncError::NotFound(format!("change-set {id}")))
    }

    /// Resolves the parent and reversed ids stored in a replica header.
    pub async fn replica_position(&self, header: &ReplicaHeader) -> SyncResult<ReplicaPosition> {
        let parent = self
            .position_of(header.repository_id, &header.parent_change_set_id)
            .await?;
        let reversed = match &header.reversed_change_set_id {
            Some(id) => Some(self.position_of(header.repository_id, id).await?),
            None => None,
        };
        Ok(ReplicaPosition::new(parent, reversed)?)
    }
}
