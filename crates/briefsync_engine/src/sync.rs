//! Moving a briefcase through the change-set history.

use crate::error::{SyncError, SyncResult};
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::{NativeEngine, NativeReplica};
use crate::rebase::RebaseReport;
use crate::remote::{CancellationHandle, ChangeSetQuery, RemoteRepository};
use crate::resolver::VersionResolver;
use briefsync_protocol::{
    ApplyOption, ChangeSet, ChangeSetPosition, OpenMode, ReplicaPosition, RepositoryId, SyncPlan,
    VersionRef,
};
use std::fs;
use tracing::{debug, info};

/// Result of moving a briefcase to a version.
#[derive(Debug, Clone, PartialEq)]
pub struct PullOutcome {
    /// The executed plan.
    pub plan: SyncPlan,
    /// Visible position afterwards.
    pub position: ChangeSetPosition,
    /// Rebase details, when local transactions were rebased semantically.
    pub rebase: Option<RebaseReport>,
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// A resolver over this manager's remote.
    pub fn resolver(&self) -> VersionResolver<'_, R> {
        VersionResolver::new(&self.remote)
    }

    /// Reads where a briefcase stands, resolving its stored ids to indices.
    pub async fn replica_position(
        &self,
        briefcase: &Briefcase<N::Replica>,
    ) -> SyncResult<ReplicaPosition> {
        let header = briefcase.header()?;
        self.resolver().replica_position(&header).await
    }

    /// Lists and downloads the change-sets after `from_id` up to and
    /// including `to_id`, ordered by index.
    ///
    /// An empty `to_id`, or `from_id == to_id`, returns an empty list
    /// without contacting the remote. Files already cached with the
    /// expected size are not downloaded again.
    pub async fn download_change_sets(
        &self,
        repository: RepositoryId,
        from_id: &str,
        to_id: &str,
        cancel: &CancellationHandle,
    ) -> SyncResult<Vec<ChangeSet>> {
        if to_id.is_empty() || from_id == to_id {
            return Ok(Vec::new());
        }

        let query = ChangeSetQuery::Between {
            after: from_id.to_string(),
            up_to: to_id.to_string(),
        };
        let mut change_sets = self.remote.list_change_sets(repository, &query).await?;
        change_sets.sort_by_key(|cs| cs.index);
        self.ensure_downloaded(repository, &change_sets, cancel).await?;
        Ok(change_sets)
    }

    pub(crate) async fn ensure_downloaded(
        &self,
        repository: RepositoryId,
        change_sets: &[ChangeSet],
        cancel: &CancellationHandle,
    ) -> SyncResult<()> {
        let dir = self.cache.change_sets_dir(repository);
        fs::create_dir_all(&dir)?;

        let missing: Vec<ChangeSet> = change_sets
            .iter()
            .filter(|cs| {
                fs::metadata(dir.join(cs.file_name()))
                    .map(|m| m.len() != cs.file_size)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        debug!(repository = %repository, count = missing.len(), "downloading change-sets");
        self.remote
            .download_change_sets(repository, &missing, &dir, cancel)
            .await?;

        if let Some(absent) = missing.iter().find(|cs| !dir.join(cs.file_name()).exists()) {
            return Err(SyncError::NotFound(format!(
                "change-set file {} after download",
                absent.file_name()
            )));
        }
        Ok(())
    }

    /// Moves a briefcase to `version`, running the reverse, reinstate and
    /// merge phases its plan requires, in that order.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the briefcase is read-only or has unsaved
    ///   changes, or if it would reverse/reinstate with pending local
    ///   transactions
    /// - `NotFound` if the version cannot be resolved
    /// - `Apply` if a phase fails
    pub async fn process_change_sets(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        version: &VersionRef,
        cancel: &CancellationHandle,
    ) -> SyncResult<PullOutcome> {
        let target = self
            .resolver()
            .resolve(briefcase.repository_id(), version)
            .await?;
        let position = self.replica_position(briefcase).await?;
        let plan = SyncPlan::compute(&position, &target);
        self.execute_plan(briefcase, &position, plan, cancel).await
    }

    pub(crate) async fn execute_plan(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        position: &ReplicaPosition,
        plan: SyncPlan,
        cancel: &CancellationHandle,
    ) -> SyncResult<PullOutcome> {
        if plan.is_noop() {
            debug!(replica = %briefcase.replica_id(), "briefcase already at target");
            return Ok(PullOutcome {
                plan,
                position: position.current().clone(),
                rebase: None,
            });
        }
        check_can_process(briefcase, &plan)?;

        let mut visible = position.current().clone();
        for (option, to) in plan.steps() {
            self.apply_phase(briefcase, option, &visible, to, cancel)
                .await?;
            visible = to.clone();
        }

        info!(
            repository = %briefcase.repository_id(),
            replica = %briefcase.replica_id(),
            position = %visible,
            "briefcase moved"
        );
        Ok(PullOutcome {
            plan,
            position: visible,
            rebase: None,
        })
    }

    async fn apply_phase(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        option: ApplyOption,
        from: &ChangeSetPosition,
        to: &ChangeSetPosition,
        cancel: &CancellationHandle,
    ) -> SyncResult<()> {
        if from.index == to.index {
            return Ok(());
        }
        let (low, high) = if from.index < to.index {
            (from, to)
        } else {
            (to, from)
        };
        let change_sets = self
            .download_change_sets(briefcase.repository_id(), &low.id, &high.id, cancel)
            .await?;
        self.apply_change_sets(briefcase, &change_sets, option).await
    }

    /// Pulls and merges change-sets up to `version`.
    ///
    /// With semantic rebase enabled and pending local transactions present,
    /// the local transactions are rebased onto the incoming change-sets.
    pub async fn pull_and_merge(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        version: &VersionRef,
    ) -> SyncResult<PullOutcome> {
        let cancel = CancellationHandle::new();
        if self.config.semantic_rebase
            && (briefcase.handle().has_pending_txns()
                || self.rebase_workspace(briefcase).has_entries())
        {
            return self.pull_with_rebase(briefcase, version, &cancel).await;
        }
        self.process_change_sets(briefcase, version, &cancel).await
    }

    /// Reverses a briefcase to an earlier version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `version` is after the visible position.
    pub async fn reverse(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        version: &VersionRef,
    ) -> SyncResult<PullOutcome> {
        let target = self
            .resolver()
            .resolve(briefcase.repository_id(), version)
            .await?;
        let position = self.replica_position(briefcase).await?;
        if target.index > position.current().index {
            return Err(SyncError::invalid_state(format!(
                "cannot reverse forward from {} to {target}",
                position.current()
            )));
        }
        let plan = SyncPlan::compute(&position, &target);
        self.execute_plan(briefcase, &position, plan, &CancellationHandle::new())
            .await
    }

    /// Reinstates reversed change-sets up to `version`, or up to the parent
    /// when `version` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the briefcase is not reversed or `version`
    /// lies outside the reversed range.
    pub async fn reinstate(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        version: Option<&VersionRef>,
    ) -> SyncResult<PullOutcome> {
        let position = self.replica_position(briefcase).await?;
        let Some(reversed) = position.reversed() else {
            return Err(SyncError::invalid_state("briefcase has no reversed changes"));
        };
        let target = match version {
            Some(v) => self.resolver().resolve(briefcase.repository_id(), v).await?,
            None => position.parent().clone(),
        };
        if target.index < reversed.index || target.index > position.parent().index {
            return Err(SyncError::invalid_state(format!(
                "cannot reinstate to {target}; reversed range is {reversed}..={}",
                position.parent()
            )));
        }
        let plan = SyncPlan::compute(&position, &target);
        self.execute_plan(briefcase, &position, plan, &CancellationHandle::new())
            .await
    }
}

fn check_can_process<H: NativeReplica>(briefcase: &Briefcase<H>, plan: &SyncPlan) -> SyncResult<()> {
    let handle = briefcase.handle();
    if !handle.is_open() {
        return Err(SyncError::invalid_state("briefcase is closed"));
    }
    if handle.open_mode() != OpenMode::ReadWrite {
        return Err(SyncError::invalid_state(
            "briefcase must be opened read-write to process change-sets",
        ));
    }
    if handle.has_unsaved_changes() {
        return Err(SyncError::invalid_state(
            "briefcase has unsaved changes; save or abandon them first",
        ));
    }
    let navigates = plan
        .steps()
        .iter()
        .any(|(option, _)| *option != ApplyOption::Merge);
    if navigates && handle.has_pending_txns() {
        return Err(SyncError::invalid_state(
            "cannot reverse or reinstate with pending local transactions; push first",
        ));
    }
    Ok(())
}
