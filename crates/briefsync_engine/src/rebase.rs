//! Semantic rebase of pending local transactions.
//!
//! When a pull brings in schema changes while local transactions are still
//! pending, the pending work has to land on top of the incoming layout.
//! Additive schema changes commute with data changes and need no help from
//! the engine. Moved or retyped properties do: the pending transactions are
//! stashed in the replica's rebase workspace, taken off the replica, the
//! incoming change-sets are merged, and the stash is transformed and
//! replayed in commit order.
//!
//! Local schema imports are merged with the incoming schema and re-imported.
//! A property added on both sides with different types is a conflict, and
//! so is a pending value that cannot follow an incoming retype. Either way
//! the replica is left untouched and the caller decides.
//!
//! The workspace outlives a failed replay. Whatever is still stashed is put
//! back on the replica at the start of the next rebasing pull.

use crate::cache::{delete_file, delete_folder_if_empty, write_atomic};
use crate::error::{SyncError, SyncResult};
use crate::manager::{Briefcase, BriefcaseManager};
use crate::native::{NativeEngine, NativeReplica};
use crate::remote::{CancellationHandle, RemoteRepository};
use crate::sync::PullOutcome;
use briefsync_protocol::{
    ChangeSet, ChangeSetPosition, OpenMode, PendingTxn, SchemaChange, SchemaDelta, SyncPlan,
    TxnPayload, VersionRef,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a pull with local schema work stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseState {
    /// No schema changes on either side.
    NoOp,
    /// Only incoming schema changes, all additive.
    TrivialIncoming,
    /// Local schema changes, all additive on both sides.
    TrivialLocal,
    /// A moved or retyped property needs record transformation.
    TransformRequired,
    /// Local work rebased onto the incoming change-sets.
    Reconciled,
    /// Incompatible schema changes; nothing was applied.
    Conflicted,
}

/// Details of a rebasing pull.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseReport {
    /// Classification before any work was done.
    pub classification: RebaseState,
    /// Final state: `Reconciled`, `Conflicted`, or the classification when
    /// no rebase was needed.
    pub state: RebaseState,
    /// Number of transactions replayed from the workspace.
    pub replayed: usize,
    /// Schema re-imported after the merge.
    pub merged_schema: Option<SchemaDelta>,
    /// The clashing property, when conflicted.
    pub conflict: Option<String>,
}

impl RebaseReport {
    fn unchanged(state: RebaseState) -> Self {
        Self {
            classification: state,
            state,
            replayed: 0,
            merged_schema: None,
            conflict: None,
        }
    }

    /// Returns true if the caller has to resolve a schema conflict.
    pub fn is_conflicted(&self) -> bool {
        self.state == RebaseState::Conflicted
    }
}

/// Classifies a pull from the local and incoming schema deltas.
pub fn classify(local: Option<&SchemaDelta>, incoming: Option<&SchemaDelta>) -> RebaseState {
    match (local, incoming) {
        (None, None) => RebaseState::NoOp,
        _ if local.is_some_and(SchemaDelta::requires_transform)
            || incoming.is_some_and(SchemaDelta::requires_transform) =>
        {
            RebaseState::TransformRequired
        }
        (None, Some(_)) => RebaseState::TrivialIncoming,
        (Some(_), _) => RebaseState::TrivialLocal,
    }
}

/// Folds several deltas into one, keeping change order and the highest
/// target version.
pub fn combine_deltas<'a>(deltas: impl IntoIterator<Item = &'a SchemaDelta>) -> Option<SchemaDelta> {
    deltas.into_iter().fold(None, |acc, delta| match acc {
        None => Some(delta.clone()),
        Some(mut combined) => {
            combined.version = combined.version.max(delta.version);
            for change in &delta.changes {
                if !combined.changes.contains(change) {
                    combined.changes.push(change.clone());
                }
            }
            Some(combined)
        }
    })
}

/// Merges the local delta onto the incoming one.
///
/// Additions from both sides are kept; an identical addition appears once.
/// A property added on both sides with different types is returned as
/// `Err("Class.property")`, whatever the target versions.
pub fn merge_schemas(local: &SchemaDelta, incoming: &SchemaDelta) -> Result<SchemaDelta, String> {
    let mut merged = SchemaDelta::new(local.schema.clone(), local.version.max(incoming.version));
    for change in incoming.changes.iter().chain(&local.changes) {
        if merged.changes.contains(change) {
            continue;
        }
        if let SchemaChange::AddProperty {
            class,
            property,
            property_type,
        } = change
        {
            let clash = merged.changes.iter().any(|existing| {
                matches!(
                    existing,
                    SchemaChange::AddProperty { class: c, property: p, property_type: t }
                        if c == class && p == property && t != property_type
                )
            });
            if clash {
                return Err(format!("{class}.{property}"));
            }
        }
        merged.changes.push(change.clone());
    }
    Ok(merged)
}

/// Rewrites a data transaction for the post-change layout. A value that
/// cannot follow a retype is returned as `Err("Class.property")`.
fn transform_txn(txn: &PendingTxn, transforms: &[&SchemaChange]) -> Result<PendingTxn, String> {
    let mut txn = txn.clone();
    let id = txn.id;
    if let TxnPayload::Data(records) = &mut txn.payload {
        for record in records.iter_mut() {
            for change in transforms {
                if let Err(e) = record.transform(change) {
                    let property = match change {
                        SchemaChange::RetypeProperty { class, property, .. } => {
                            format!("{class}.{property}")
                        }
                        other => format!("{other:?}"),
                    };
                    warn!(txn = id, element = %record.element_id, %property, error = %e, "pending value cannot follow schema change");
                    return Err(property);
                }
            }
        }
    }
    Ok(txn)
}

/// Transactions as they will be replayed after the merge: data transformed,
/// the first schema import replaced by the merged schema and later ones
/// folded into it.
fn prepare_replay(
    txns: &[PendingTxn],
    transforms: &[&SchemaChange],
    merged_schema: Option<&SchemaDelta>,
) -> Result<Vec<PendingTxn>, String> {
    let mut prepared = Vec::with_capacity(txns.len());
    let mut schema_imported = false;
    for txn in txns {
        match &txn.payload {
            TxnPayload::Schema(_) => {
                if !schema_imported {
                    if let Some(merged) = merged_schema {
                        prepared.push(PendingTxn::schema_import(txn.id, merged.clone()));
                    }
                    schema_imported = true;
                }
            }
            TxnPayload::Data(_) => prepared.push(transform_txn(txn, transforms)?),
        }
    }
    Ok(prepared)
}

fn conflicted(position: ChangeSetPosition, classification: RebaseState, property: String) -> PullOutcome {
    PullOutcome {
        plan: SyncPlan::NoOp,
        position,
        rebase: Some(RebaseReport {
            classification,
            state: RebaseState::Conflicted,
            replayed: 0,
            merged_schema: None,
            conflict: Some(property),
        }),
    }
}

/// Scratch folder holding stashed transactions during a rebase.
#[derive(Debug, Clone)]
pub struct RebaseWorkspace {
    dir: PathBuf,
}

impl RebaseWorkspace {
    /// Workspace rooted at `dir`. Nothing is created until the first stash.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Workspace folder.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persists a transaction.
    pub fn stash(&self, txn: &PendingTxn) -> SyncResult<()> {
        write_atomic(&self.entry_path(txn.id), &serde_json::to_vec(txn)?)
    }

    /// Stashed transactions ordered by id.
    pub fn entries(&self) -> SyncResult<Vec<PendingTxn>> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for entry in read {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entries.push(serde_json::from_slice::<PendingTxn>(&fs::read(&path)?)?);
            }
        }
        entries.sort_by_key(|txn| txn.id);
        Ok(entries)
    }

    /// Drops a replayed transaction.
    pub fn remove(&self, id: u64) -> bool {
        delete_file(&self.entry_path(id))
    }

    /// Returns true if transactions are waiting to be replayed.
    pub fn has_entries(&self) -> bool {
        fs::read_dir(&self.dir).is_ok_and(|mut read| read.next().is_some())
    }

    /// Removes the folder if nothing is left in it.
    pub fn finish(&self) -> bool {
        !self.dir.exists() || delete_folder_if_empty(&self.dir)
    }
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Imports a schema delta as a pending local transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the briefcase is read-only or has unsaved
    /// changes; the schema version is left unchanged.
    pub fn import_schema(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        delta: &SchemaDelta,
    ) -> SyncResult<()> {
        let handle = briefcase.handle();
        if handle.open_mode() != OpenMode::ReadWrite {
            return Err(SyncError::invalid_state(
                "briefcase must be opened read-write to import schema",
            ));
        }
        if handle.has_unsaved_changes() {
            return Err(SyncError::invalid_state(
                "cannot import schema with unsaved changes",
            ));
        }
        briefcase.handle_mut().import_schema(delta)?;
        info!(
            replica = %briefcase.replica_id(),
            schema = %delta.schema,
            version = delta.version,
            "schema imported"
        );
        Ok(())
    }

    pub(crate) fn rebase_workspace(&self, briefcase: &Briefcase<N::Replica>) -> RebaseWorkspace {
        RebaseWorkspace::new(
            self.cache
                .rebase_dir(briefcase.repository_id(), briefcase.replica_id()),
        )
    }

    /// Pull-and-merge that rebases pending local transactions onto the
    /// incoming schema.
    ///
    /// Transactions left in the workspace by an interrupted replay are put
    /// back on the replica first. A pending value that cannot follow an
    /// incoming retype is reported as a conflict before anything is applied.
    pub(crate) async fn pull_with_rebase(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        version: &VersionRef,
        cancel: &CancellationHandle,
    ) -> SyncResult<PullOutcome> {
        let workspace = self.rebase_workspace(briefcase);
        self.resume_stash(briefcase, &workspace)?;

        let repository = briefcase.repository_id();
        let target = self.resolver().resolve(repository, version).await?;
        let position = self.replica_position(briefcase).await?;
        let plan = SyncPlan::compute(&position, &target);
        let SyncPlan::Merge { to } = &plan else {
            return self.execute_plan(briefcase, &position, plan, cancel).await;
        };

        let txns = briefcase.handle().pending_txns()?;
        let local = combine_deltas(txns.iter().filter_map(PendingTxn::schema));
        let incoming_sets = self
            .download_change_sets(repository, &position.parent().id, &to.id, cancel)
            .await?;
        let incoming = self.incoming_schema(briefcase, &incoming_sets)?;
        let classification = classify(local.as_ref(), incoming.as_ref());
        debug!(replica = %briefcase.replica_id(), ?classification, "rebase classified");

        let merged_schema = match (&local, &incoming) {
            (Some(l), Some(i)) => match merge_schemas(l, i) {
                Ok(merged) => Some(merged),
                Err(property) => {
                    warn!(replica = %briefcase.replica_id(), %property, "incompatible concurrent schema changes");
                    return Ok(conflicted(position.current().clone(), classification, property));
                }
            },
            (Some(l), None) => Some(l.clone()),
            _ => None,
        };

        if classification != RebaseState::TransformRequired && local.is_none() {
            let mut outcome = self.execute_plan(briefcase, &position, plan, cancel).await?;
            outcome.rebase = Some(RebaseReport::unchanged(classification));
            return Ok(outcome);
        }

        let transforms: Vec<&SchemaChange> = incoming
            .iter()
            .flat_map(|delta| delta.changes.iter())
            .filter(|change| !change.is_additive())
            .collect();
        let prepared = match prepare_replay(&txns, &transforms, merged_schema.as_ref()) {
            Ok(prepared) => prepared,
            Err(property) => {
                return Ok(conflicted(position.current().clone(), classification, property));
            }
        };

        for txn in &txns {
            workspace.stash(txn)?;
        }
        briefcase.handle_mut().discard_pending_txns()?;
        debug!(count = txns.len(), dir = %workspace.dir().display(), "pending transactions stashed");

        let mut outcome = match self.execute_plan(briefcase, &position, plan, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.replay_stash(briefcase, &workspace);
                return Err(e);
            }
        };

        for txn in &txns {
            workspace.remove(txn.id);
        }
        for txn in &prepared {
            workspace.stash(txn)?;
        }
        let replayed = self.resume_stash(briefcase, &workspace)?;

        info!(
            replica = %briefcase.replica_id(),
            replayed,
            position = %outcome.position,
            "local transactions rebased"
        );
        outcome.rebase = Some(RebaseReport {
            classification,
            state: RebaseState::Reconciled,
            replayed,
            merged_schema,
            conflict: None,
        });
        Ok(outcome)
    }

    fn incoming_schema(
        &self,
        briefcase: &Briefcase<N::Replica>,
        change_sets: &[ChangeSet],
    ) -> SyncResult<Option<SchemaDelta>> {
        let dir = self.cache.change_sets_dir(briefcase.repository_id());
        let mut deltas = Vec::new();
        for cs in change_sets.iter().filter(|cs| cs.change_type.is_schema()) {
            if let Some(delta) = self.native.read_schema_delta(&cs.to_token(&dir))? {
                deltas.push(delta);
            }
        }
        Ok(combine_deltas(&deltas))
    }

    /// Replays the workspace in commit order, dropping each entry once it is
    /// back on the replica. Entries that fail stay in the workspace.
    fn resume_stash(
        &self,
        briefcase: &mut Briefcase<N::Replica>,
        workspace: &RebaseWorkspace,
    ) -> SyncResult<usize> {
        let entries = workspace.entries()?;
        if entries.is_empty() {
            workspace.finish();
            return Ok(0);
        }
        let mut replayed = 0;
        for txn in entries {
            briefcase.handle_mut().replay_txn(&txn)?;
            workspace.remove(txn.id);
            replayed += 1;
        }
        workspace.finish();
        debug!(replica = %briefcase.replica_id(), replayed, "stashed transactions replayed");
        Ok(replayed)
    }

    /// Puts the stash back after a failed merge. Failures are logged and the
    /// remaining entries are left for the next pull.
    fn replay_stash(&self, briefcase: &mut Briefcase<N::Replica>, workspace: &RebaseWorkspace) {
        if let Err(e) = self.resume_stash(briefcase, workspace) {
            warn!(
                replica = %briefcase.replica_id(),
                dir = %workspace.dir().display(),
                error = %e,
                "cannot restore stashed transactions; left for the next pull"
            );
        }
    }
}
