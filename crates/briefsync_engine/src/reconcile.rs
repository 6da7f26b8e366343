//! Code and lock reconciliation after a push.
//!
//! A pushed change-set is not durable until the codes it uses are claimed
//! on the remote. The change-set id is recorded in a per-replica pending
//! file *before* the claim is attempted, so an interrupted reconciliation
//! leaves a trace that `reconcile_pending` picks up later.
//!
//! # Invariants
//!
//! - An id leaves the pending set only on confirmed success or on a
//!   code conflict (the conflict is the final outcome).
//! - Any other failure leaves the id pending.

use crate::cache::{delete_file, write_atomic};
use crate::error::{SyncError, SyncResult};
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::NativeEngine;
use crate::remote::{CancellationHandle, ChangeSetQuery, RemoteRepository, RemoteStatus};
use briefsync_protocol::{ChangeSet, CodeUpdateOptions, ReplicaId, RepositoryId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable set of change-set ids with unconfirmed code reconciliation.
#[derive(Debug, Default)]
pub struct PendingCodeSet {
    path: PathBuf,
    ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingCodeFile {
    change_set_ids: Vec<String>,
}

impl PendingCodeSet {
    /// Loads the set stored at `path`; a missing file is an empty set.
    pub fn load(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let ids = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<PendingCodeFile>(&data)?.change_set_ids,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, ids })
    }

    /// Pending ids in the order they were added.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Returns true if `id` is pending.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|p| p == id)
    }

    /// Number of pending ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Adds an id and persists the set.
    pub fn insert(&mut self, id: &str) -> SyncResult<()> {
        if !self.contains(id) {
            self.ids.push(id.to_string());
        }
        self.save()
    }

    /// Removes an id and persists the set.
    pub fn remove(&mut self, id: &str) -> SyncResult<()> {
        let before = self.ids.len();
        self.ids.retain(|p| p != id);
        if self.ids.len() == before {
            return Ok(());
        }
        self.save()
    }

    fn save(&self) -> SyncResult<()> {
        if self.ids.is_empty() {
            delete_file(&self.path);
            return Ok(());
        }
        let file = PendingCodeFile {
            change_set_ids: self.ids.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }
}

/// Final state of one change-set's code reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Codes claimed.
    Reconciled,
    /// Another replica holds some codes; recorded and dropped.
    Conflicted,
    /// Outcome unknown; the id stays pending.
    Deferred,
}

/// Summary of a `reconcile_pending` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Ids examined in this sweep.
    pub processed: usize,
    /// Ids reconciled.
    pub reconciled: usize,
    /// Ids dropped because of code conflicts.
    pub conflicted: usize,
    /// Ids left pending.
    pub deferred: usize,
    /// Ids still pending after the sweep.
    pub remaining: usize,
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Ids of change-sets whose code reconciliation is unconfirmed.
    pub fn pending_codes(&self, briefcase: &Briefcase<N::Replica>) -> SyncResult<Vec<String>> {
        let pending = PendingCodeSet::load(self.pending_codes_path(briefcase))?;
        Ok(pending.ids().to_vec())
    }

    fn pending_codes_path(&self, briefcase: &Briefcase<N::Replica>) -> PathBuf {
        self.cache
            .pending_codes_path(briefcase.repository_id(), briefcase.replica_id())
    }

    /// Reconciles the codes of a change-set stored in `file`, optionally
    /// relinquishing all codes and locks of the replica afterwards.
    ///
    /// Relinquish failures are logged and swallowed.
    pub async fn reconcile(
        &self,
        briefcase: &Briefcase<N::Replica>,
        change_set: &ChangeSet,
        file: &Path,
        relinquish_after: bool,
    ) -> SyncResult<ReconcileOutcome> {
        let mut pending = PendingCodeSet::load(self.pending_codes_path(briefcase))?;
        pending.insert(&change_set.id)?;

        let outcome = self
            .update_codes_from_file(
                briefcase.repository_id(),
                briefcase.replica_id(),
                &change_set.id,
                file,
                &mut pending,
            )
            .await?;

        if relinquish_after {
            self.relinquish(briefcase.repository_id(), briefcase.replica_id())
                .await;
        }
        Ok(outcome)
    }

    /// Retries reconciliation for up to `reconcile_batch_limit` pending ids,
    /// re-downloading each change-set and re-extracting its codes.
    pub async fn reconcile_pending(
        &self,
        briefcase: &Briefcase<N::Replica>,
    ) -> SyncResult<ReconcileSummary> {
        let repository = briefcase.repository_id();
        let replica = briefcase.replica_id();
        let mut pending = PendingCodeSet::load(self.pending_codes_path(briefcase))?;
        let batch: Vec<String> = pending
            .ids()
            .iter()
            .take(self.config.reconcile_batch_limit)
            .cloned()
            .collect();

        let mut summary = ReconcileSummary::default();
        let dir = self.cache.change_sets_dir(repository);
        for id in batch {
            summary.processed += 1;
            let outcome = match self.fetch_change_set(repository, &id).await {
                Ok(cs) => {
                    let file = dir.join(cs.file_name());
                    self.update_codes_from_file(repository, replica, &id, &file, &mut pending)
                        .await?
                }
                Err(e) => {
                    warn!(change_set = %id, error = %e, "cannot fetch change-set for code reconciliation");
                    ReconcileOutcome::Deferred
                }
            };
            match outcome {
                ReconcileOutcome::Reconciled => summary.reconciled += 1,
                ReconcileOutcome::Conflicted => summary.conflicted += 1,
                ReconcileOutcome::Deferred => summary.deferred += 1,
            }
        }
        summary.remaining = pending.len();
        info!(
            repository = %repository,
            replica = %replica,
            processed = summary.processed,
            remaining = summary.remaining,
            "pending code reconciliation sweep"
        );
        Ok(summary)
    }

    async fn fetch_change_set(&self, repository: RepositoryId, id: &str) -> SyncResult<ChangeSet> {
        let found = self
            .remote
            .list_change_sets(repository, &ChangeSetQuery::ById(id.to_string()))
            .await?;
        let cs = found
            .into_iter()
            .find(|cs| cs.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("change-set {id}")))?;
        self.ensure_downloaded(repository, std::slice::from_ref(&cs), &CancellationHandle::new())
            .await?;
        Ok(cs)
    }

    async fn update_codes_from_file(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
        id: &str,
        file: &Path,
        pending: &mut PendingCodeSet,
    ) -> SyncResult<ReconcileOutcome> {
        let codes = match self.native.extract_codes(file) {
            Ok(codes) => codes,
            Err(e) => {
                warn!(change_set = %id, error = %e, "cannot extract codes");
                return Ok(ReconcileOutcome::Deferred);
            }
        };

        match self
            .remote
            .update_codes(repository, replica, &codes, CodeUpdateOptions::after_push())
            .await
        {
            Ok(()) => {
                debug!(change_set = %id, count = codes.len(), "codes reconciled");
                pending.remove(id)?;
                Ok(ReconcileOutcome::Reconciled)
            }
            Err(e) if e.status == RemoteStatus::ConflictingCodes => {
                warn!(change_set = %id, error = %e, "codes held by another briefcase");
                pending.remove(id)?;
                Ok(ReconcileOutcome::Conflicted)
            }
            Err(e) => {
                warn!(change_set = %id, error = %e, "code reconciliation deferred");
                Ok(ReconcileOutcome::Deferred)
            }
        }
    }

    async fn relinquish(&self, repository: RepositoryId, replica: ReplicaId) {
        if let Err(e) = self.remote.delete_all_codes(repository, replica).await {
            warn!(replica = %replica, error = %e, "cannot relinquish codes");
        }
        if let Err(e) = self.remote.delete_all_locks(repository, replica).await {
            warn!(replica = %replica, error = %e, "cannot relinquish locks");
        }
    }
}
