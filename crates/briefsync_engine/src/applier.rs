//! Bridge to the native change-set applier.
//!
//! Small data-only batches are applied on the caller's task, one change-set
//! at a time, yielding between change-sets. Batches carrying schema changes
//! or any file above the configured threshold take the asynchronous path:
//! the replica handle is closed, the batch runs on a blocking worker
//! against the file, and the handle is reopened in its previous mode.

use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::{NativeEngine, NativeReplica};
use crate::remote::RemoteRepository;
use briefsync_protocol::{ApplyOption, ApplyRequest, ChangeSet, ChangeSetPosition};
use std::sync::Arc;
use tracing::{debug, warn};

/// Returns true if a batch must be applied off the caller's task.
pub fn needs_async_apply(change_sets: &[ChangeSet], threshold: u64) -> bool {
    change_sets.iter().any(|cs| cs.change_type.is_schema())
        || change_sets.iter().map(|cs| cs.file_size).max().unwrap_or(0) > threshold
}

/// Position the replica lands on after applying `ordered` with `option`.
fn landing(ordered: &[ChangeSet], option: ApplyOption) -> ChangeSetPosition {
    match (ordered.last(), option) {
        (None, _) => ChangeSetPosition::initial(),
        (Some(last), ApplyOption::Reverse) => {
            ChangeSetPosition::new(last.parent_id.clone(), last.index.saturating_sub(1))
        }
        (Some(last), _) => last.position(),
    }
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Applies downloaded change-sets to a briefcase.
    ///
    /// `change_sets` are given in index order; reverse batches are applied
    /// newest first. Applies cannot be cancelled once started.
    ///
    /// # Errors
    ///
    /// Returns an `Apply` error on the first failed change-set, or when the
    /// replica cannot be reopened after an asynchronous apply.
    pub async fn apply_change_sets(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        change_sets: &[ChangeSet],
        option: ApplyOption,
    ) -> SyncResult<()> {
        if change_sets.is_empty() {
            return Ok(());
        }

        let mut ordered = change_sets.to_vec();
        ordered.sort_by_key(|cs| cs.index);
        if option == ApplyOption::Reverse {
            ordered.reverse();
        }

        if needs_async_apply(&ordered, self.config.async_apply_threshold) {
            self.apply_async(briefcase, &ordered, option).await
        } else {
            self.apply_sync(briefcase, &ordered, option).await
        }
    }

    async fn apply_sync(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        ordered: &[ChangeSet],
        option: ApplyOption,
    ) -> SyncResult<()> {
        let dir = self.cache.change_sets_dir(briefcase.repository_id());
        for cs in ordered {
            let token = cs.to_token(&dir);
            let status = briefcase.handle_mut().apply_change_set(&token, option);
            if !status.is_success() {
                return Err(SyncError::apply(
                    format!("{option} of change-set {} failed", cs.id),
                    Some(status),
                ));
            }
            debug!(change_set = %cs.id, index = cs.index, %option, "applied change-set");
            tokio::task::yield_now().await;
        }

        self.events.publish(SyncEvent::Applied {
            repository: briefcase.repository_id(),
            replica: briefcase.replica_id(),
            option,
            position: landing(ordered, option),
            success: true,
        });
        Ok(())
    }

    async fn apply_async(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        ordered: &[ChangeSet],
        option: ApplyOption,
    ) -> SyncResult<()> {
        let dir = self.cache.change_sets_dir(briefcase.repository_id());
        let request = ApplyRequest::new(ordered.iter().map(|cs| cs.to_token(&dir)).collect(), option);
        let mode = briefcase.handle().open_mode();
        let path = briefcase.path().to_path_buf();

        debug!(count = ordered.len(), %option, path = %path.display(), "applying change-sets off task");
        briefcase.handle_mut().close();

        let native = Arc::clone(&self.native);
        let outcome =
            tokio::task::spawn_blocking(move || native.apply_batch(&path, &request)).await;
        let reopened = briefcase.handle_mut().reopen(mode);

        let applied = match &outcome {
            Ok(response) => response.status.is_success(),
            Err(_) => false,
        };
        self.events.publish(SyncEvent::Applied {
            repository: briefcase.repository_id(),
            replica: briefcase.replica_id(),
            option,
            position: landing(ordered, option),
            success: applied && reopened.is_ok(),
        });

        if let Err(e) = reopened {
            warn!(error = %e, "replica could not be reopened after apply");
            return Err(SyncError::apply(format!("cannot reopen replica: {e}"), None));
        }
        let response = outcome
            .map_err(|e| SyncError::apply(format!("apply worker failed: {e}"), None))?;
        if !response.status.is_success() {
            let failed = ordered
                .get(response.applied)
                .map(|cs| cs.id.as_str())
                .unwrap_or("<unknown>");
            return Err(SyncError::apply(
                format!(
                    "{option} of change-set {failed} failed: {}",
                    response.message.as_deref().unwrap_or("no detail")
                ),
                Some(response.status),
            ));
        }
        Ok(())
    }
}
