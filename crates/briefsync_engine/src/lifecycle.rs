//! Acquiring, opening, enumerating and deleting local replicas.

use crate::cache::{delete_file, delete_folder};
use crate::error::{SyncError, SyncResult};
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::{NativeEngine, NativeReplica};
use crate::remote::{CancellationHandle, RemoteRepository};
use briefsync_protocol::{
    ChangeSetPosition, OpenMode, ReplicaHeader, ReplicaId, ReplicaPosition, RepositoryId,
    SyncPlan, VersionRef,
};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A replica file found in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBriefcaseProps {
    /// Replica file.
    pub path: PathBuf,
    /// Identity header read from the file.
    pub header: ReplicaHeader,
    /// File size in bytes.
    pub file_size: u64,
}

/// What `delete` managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The replica id was released on the remote.
    pub released: bool,
    /// Every local artifact was removed.
    pub removed_local: bool,
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Asks the remote for a new replica id.
    ///
    /// # Errors
    ///
    /// Returns `CannotAcquire` if the remote refuses.
    pub async fn acquire_replica_id(&self, repository: RepositoryId) -> SyncResult<ReplicaId> {
        let replica = self
            .remote
            .acquire_replica_id(repository)
            .await
            .map_err(SyncError::CannotAcquire)?;
        if !replica.is_valid() {
            return Err(SyncError::invalid_state(format!(
                "remote issued replica id {replica} outside the valid range"
            )));
        }
        debug!(repository = %repository, replica = %replica, "replica id acquired");
        Ok(replica)
    }

    /// Downloads a new replica at `version`.
    ///
    /// The nearest snapshot at or before the target is fetched, stamped with
    /// a freshly acquired replica id, and merged forward when older than the
    /// target. On failure the partial file is removed and the id released.
    pub async fn download(
        &self,
        repository: RepositoryId,
        version: &VersionRef,
        cancel: &CancellationHandle,
    ) -> SyncResult<Briefcase<N::Replica>> {
        let target = self.resolver().resolve(repository, version).await?;
        let replica = self.acquire_replica_id(repository).await?;

        match self
            .download_replica(repository, replica, &target, cancel)
            .await
        {
            Ok(briefcase) => {
                info!(
                    repository = %repository,
                    replica = %replica,
                    position = %target,
                    "briefcase downloaded"
                );
                Ok(briefcase)
            }
            Err(e) => {
                warn!(repository = %repository, replica = %replica, error = %e, "briefcase download failed");
                delete_folder(&self.cache.replica_dir(repository, replica));
                if let Err(release) = self.remote.release_replica_id(repository, replica).await {
                    warn!(replica = %replica, error = %release, "cannot release replica id");
                }
                Err(e)
            }
        }
    }

    async fn download_replica(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
        target: &ChangeSetPosition,
        cancel: &CancellationHandle,
    ) -> SyncResult<Briefcase<N::Replica>> {
        let path = self.cache.replica_path(repository, replica);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let snapshot = self
            .remote
            .download_snapshot(repository, target, &path, cancel)
            .await?;
        let mut handle = self.native.open(&path, OpenMode::ReadWrite)?;
        handle.set_replica_id(replica)?;
        let mut briefcase = Briefcase::new(repository, replica, handle);

        if snapshot.index < target.index {
            debug!(snapshot = %snapshot, target = %target, "merging snapshot forward");
            let position = ReplicaPosition::at(snapshot);
            let plan = SyncPlan::compute(&position, target);
            self.execute_plan(&mut briefcase, &position, plan, cancel)
                .await?;
        }
        Ok(briefcase)
    }

    /// Opens a replica already in the cache.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist, or `InvalidState` if
    /// it belongs to another repository or replica.
    pub fn open(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
        mode: OpenMode,
    ) -> SyncResult<Briefcase<N::Replica>> {
        let path = self.cache.replica_path(repository, replica);
        if !path.is_file() {
            return Err(SyncError::NotFound(format!(
                "briefcase {}",
                path.display()
            )));
        }
        let handle = self.native.open(&path, mode)?;
        let header = handle.header()?;
        if header.repository_id != repository || header.replica_id != replica {
            return Err(SyncError::invalid_state(format!(
                "{} holds replica {} of repository {}",
                path.display(),
                header.replica_id,
                header.repository_id
            )));
        }
        Ok(Briefcase::new(repository, replica, handle))
    }

    /// Lists every replica in the cache. Files whose header cannot be read
    /// are skipped.
    pub fn list_local(&self) -> Vec<LocalBriefcaseProps> {
        self.cache
            .replica_candidates()
            .into_iter()
            .filter_map(|path| match self.native.read_header(&path) {
                Ok(header) => {
                    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    Some(LocalBriefcaseProps {
                        path,
                        header,
                        file_size,
                    })
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable briefcase");
                    None
                }
            })
            .collect()
    }

    /// Closes and deletes a briefcase.
    pub async fn delete(&self, briefcase: Briefcase<N::Replica>) -> DeleteOutcome {
        let repository = briefcase.repository_id();
        let replica = briefcase.replica_id();
        let mut handle = briefcase.into_handle();
        handle.close();
        drop(handle);
        self.delete_local(repository, replica).await
    }

    /// Releases a replica id (when in the valid range) and removes the
    /// replica file, its rebase workspace, its pending-code file and its
    /// folder.
    ///
    /// Release is best-effort: an id unknown to the remote, or a failed
    /// call, is logged and only prevents the id from being reused.
    pub async fn delete_local(&self, repository: RepositoryId, replica: ReplicaId) -> DeleteOutcome {
        let released = replica.is_valid() && self.release_if_present(repository, replica).await;

        let removals = [
            delete_file(&self.cache.replica_path(repository, replica)),
            delete_folder(&self.cache.rebase_dir(repository, replica)),
            delete_file(&self.cache.pending_codes_path(repository, replica)),
            delete_folder(&self.cache.replica_dir(repository, replica)),
        ];
        let removed_local = removals.iter().all(|removed| *removed);
        info!(
            repository = %repository,
            replica = %replica,
            released,
            removed_local,
            "briefcase deleted"
        );
        DeleteOutcome {
            released,
            removed_local,
        }
    }

    async fn release_if_present(&self, repository: RepositoryId, replica: ReplicaId) -> bool {
        match self.remote.replica_exists(repository, replica).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(replica = %replica, "replica id unknown to the remote; not released");
                return false;
            }
            Err(e) => {
                warn!(replica = %replica, error = %e, "cannot query replica id");
                return false;
            }
        }
        match self.remote.release_replica_id(repository, replica).await {
            Ok(()) => true,
            Err(e) => {
                warn!(replica = %replica, error = %e, "cannot release replica id");
                false
            }
        }
    }

    /// Removes the cached change-set files of a repository together with
    /// the change summary and changed elements caches derived from them.
    pub fn purge_change_sets(&self, repository: RepositoryId) -> bool {
        let change_sets = delete_folder(&self.cache.change_sets_dir(repository));
        let summaries = delete_file(&self.cache.change_summaries_path(repository));
        let elements = delete_file(&self.cache.changed_elements_path(repository));
        change_sets && summaries && elements
    }
}

