//! Push orchestration.
//!
//! Each attempt pulls and merges up to the latest remote change-set,
//! writes the pending local transactions into a new change-set and uploads
//! it. Only contention errors are retried, after a random delay; every
//! other failure ends the push on the attempt it happened.

use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::{LocalChangeSet, NativeEngine, NativeReplica};
use crate::remote::{RemoteRepository, RemoteStatus};
use briefsync_protocol::{ChangeSet, ChangeSetType, OpenMode, VersionRef};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The change-set is on the remote.
    Pushed(ChangeSet),
    /// No pending local transactions after the pull.
    NothingToPush,
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Pushes pending local transactions as a new change-set.
    ///
    /// A change-set that carries schema is always pushed as
    /// `ChangeSetType::Schema`. After the upload the change-set's codes are
    /// reconciled; with `relinquish_locks` the replica's codes and locks are
    /// released afterwards.
    ///
    /// # Errors
    ///
    /// - `InvalidState` for a standalone or read-only briefcase, or one
    ///   with unsaved changes
    /// - `Contention` when the retry budget is spent
    /// - `RebaseConflict` when the pull hit incompatible schema changes
    pub async fn push(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        description: &str,
        change_type: ChangeSetType,
        relinquish_locks: bool,
    ) -> SyncResult<PushOutcome> {
        check_can_push(briefcase)?;

        let retry = &self.config.push_retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        let (change_set, file) = loop {
            attempt += 1;
            match self.push_attempt(briefcase, description, change_type).await {
                Ok(Some(pushed)) => break pushed,
                Ok(None) => {
                    debug!(replica = %briefcase.replica_id(), "nothing to push");
                    return Ok(PushOutcome::NothingToPush);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = retry.random_delay();
                    warn!(
                        replica = %briefcase.replica_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "push contended, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self
            .reconcile(briefcase, &change_set, &file, relinquish_locks)
            .await
        {
            warn!(change_set = %change_set.id, error = %e, "code reconciliation failed after push");
        }
        Ok(PushOutcome::Pushed(change_set))
    }

    async fn push_attempt(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        description: &str,
        change_type: ChangeSetType,
    ) -> SyncResult<Option<(ChangeSet, PathBuf)>> {
        let pulled = self.pull_and_merge(briefcase, &VersionRef::Latest).await?;
        if let Some(conflict) = pulled.rebase.as_ref().and_then(|r| r.conflict.as_ref()) {
            return Err(SyncError::RebaseConflict(format!(
                "pending local work conflicts with incoming schema at {conflict}"
            )));
        }
        if !briefcase.handle().has_pending_txns() {
            return Ok(None);
        }

        let local = briefcase.handle_mut().start_create_change_set()?;
        let change_set = new_change_set(briefcase, &local, pulled.position.index + 1, description, change_type);
        let repository = briefcase.repository_id();

        match self
            .remote
            .create_change_set(repository, &change_set, &local.pathname)
            .await
        {
            Ok(created) => {
                briefcase.handle_mut().finish_create_change_set(&created)?;
                info!(
                    repository = %repository,
                    replica = %briefcase.replica_id(),
                    change_set = %created.id,
                    index = created.index,
                    "change-set pushed"
                );
                self.events.publish(SyncEvent::Pushed {
                    repository,
                    replica: briefcase.replica_id(),
                    change_set: created.clone(),
                });
                Ok(Some((created, local.pathname)))
            }
            Err(e) if e.status == RemoteStatus::ChangeSetAlreadyExists => {
                info!(change_set = %change_set.id, "change-set already on the remote");
                briefcase.handle_mut().finish_create_change_set(&change_set)?;
                Ok(Some((change_set, local.pathname)))
            }
            Err(e) => {
                briefcase.handle_mut().abandon_create_change_set();
                Err(e.into())
            }
        }
    }
}

fn new_change_set<H: NativeReplica>(
    briefcase: &Briefcase<H>,
    local: &LocalChangeSet,
    index: u64,
    description: &str,
    change_type: ChangeSetType,
) -> ChangeSet {
    ChangeSet {
        id: local.id.clone(),
        parent_id: local.parent_id.clone(),
        index,
        change_type: if local.contains_schema {
            ChangeSetType::Schema
        } else {
            change_type
        },
        file_size: local.file_size,
        description: description.to_string(),
        push_date: None,
        replica_id: Some(briefcase.replica_id()),
    }
}

fn check_can_push<H: NativeReplica>(briefcase: &Briefcase<H>) -> SyncResult<()> {
    if !briefcase.replica_id().is_valid() {
        return Err(SyncError::invalid_state(format!(
            "replica id {} cannot push",
            briefcase.replica_id()
        )));
    }
    let handle = briefcase.handle();
    if !handle.is_open() || handle.open_mode() != OpenMode::ReadWrite {
        return Err(SyncError::invalid_state(
            "briefcase must be open read-write to push",
        ));
    }
    if handle.has_unsaved_changes() {
        return Err(SyncError::invalid_state(
            "briefcase has unsaved changes; save or abandon them first",
        ));
    }
    Ok(())
}
