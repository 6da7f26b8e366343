//! In-memory remote repository.
//!
//! Keeps the change-set history, named versions, snapshots, issued replica
//! ids and code ownership of any number of repositories behind one mutex.
//! Failures can be queued per call kind and every call is counted, so tests
//! can assert both outcomes and traffic.

use crate::native::{ChangeSetFile, RecordOp, ReplicaState};
use briefsync_engine::{
    CancellationHandle, ChangeSetQuery, RemoteError, RemoteRepository, RemoteResult, RemoteStatus,
};
use briefsync_protocol::{
    ChangeSet, ChangeSetPosition, ChangeSetType, Code, CodeUpdateOptions, ReplicaId, RepositoryId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

/// Calls received, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `list_change_sets`.
    pub list: usize,
    /// `download_change_sets`.
    pub download: usize,
    /// Change-set files written by `download_change_sets`.
    pub files_downloaded: usize,
    /// `create_change_set`.
    pub create: usize,
    /// `download_snapshot`.
    pub snapshot: usize,
    /// `acquire_replica_id`.
    pub acquire: usize,
    /// `release_replica_id`.
    pub release: usize,
    /// `replica_exists`.
    pub exists: usize,
    /// `update_codes`.
    pub update_codes: usize,
    /// `delete_all_codes`.
    pub delete_codes: usize,
    /// `delete_all_locks`.
    pub delete_locks: usize,
}

/// A queued upload failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadFailure {
    /// Status to report.
    pub status: RemoteStatus,
    /// Accept the change-set before reporting the failure.
    pub commit: bool,
}

#[derive(Debug, Default)]
struct RepoState {
    history: Vec<(ChangeSet, Vec<u8>)>,
    named: HashMap<String, String>,
    snapshots: Vec<(ChangeSetPosition, Vec<u8>)>,
    codes: BTreeMap<Code, ReplicaId>,
    locks: HashSet<ReplicaId>,
}

impl RepoState {
    fn tip(&self) -> ChangeSetPosition {
        self.history
            .last()
            .map(|(cs, _)| cs.position())
            .unwrap_or_else(ChangeSetPosition::initial)
    }

    fn index_of(&self, id: &str) -> Option<u64> {
        if id.is_empty() {
            return Some(0);
        }
        self.history
            .iter()
            .find(|(cs, _)| cs.id == id)
            .map(|(cs, _)| cs.index)
    }

    fn append(&mut self, mut change_set: ChangeSet, bytes: Vec<u8>) -> ChangeSet {
        change_set.index = self.history.len() as u64 + 1;
        change_set.file_size = bytes.len() as u64;
        self.history.push((change_set.clone(), bytes));
        change_set
    }
}

#[derive(Debug, Default)]
struct Inner {
    repos: HashMap<RepositoryId, RepoState>,
    replicas: HashSet<(RepositoryId, ReplicaId)>,
    next_replica: u32,
    upload_failures: VecDeque<UploadFailure>,
    code_failures: VecDeque<RemoteStatus>,
    deny_acquire: Option<RemoteStatus>,
    exists_failure: Option<RemoteStatus>,
    calls: CallCounts,
}

impl Inner {
    fn repo(&mut self, repository: RepositoryId) -> RemoteResult<&mut RepoState> {
        self.repos.get_mut(&repository).ok_or_else(|| {
            RemoteError::new(RemoteStatus::Unknown, format!("repository {repository} not found"))
        })
    }
}

/// In-memory remote authority.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new empty repository.
    pub fn create_repository(&self) -> RepositoryId {
        let id = RepositoryId::new_v4();
        self.inner.lock().repos.insert(id, RepoState::default());
        id
    }

    /// Appends a change-set built from `file`. The file's parent must be the
    /// current tip.
    pub fn append(&self, repository: RepositoryId, file: &ChangeSetFile, description: &str) -> ChangeSet {
        let mut inner = self.inner.lock();
        let repo = inner.repos.get_mut(&repository).expect("repository exists");
        assert_eq!(file.parent_id, repo.tip().id, "change-set must extend the tip");
        let change_set = ChangeSet {
            id: file.id.clone(),
            parent_id: file.parent_id.clone(),
            index: 0,
            change_type: if file.schema.is_some() {
                ChangeSetType::Schema
            } else {
                ChangeSetType::Regular
            },
            file_size: 0,
            description: description.to_string(),
            push_date: None,
            replica_id: None,
        };
        repo.append(change_set, file.to_bytes())
    }

    /// Appends a data-only change-set on top of the tip.
    pub fn append_ops(&self, repository: RepositoryId, ops: Vec<RecordOp>) -> ChangeSet {
        let file = ChangeSetFile::new(self.tip(repository).id, ops, None, Vec::new());
        self.append(repository, &file, "")
    }

    /// Latest position.
    pub fn tip(&self, repository: RepositoryId) -> ChangeSetPosition {
        self.inner
            .lock()
            .repos
            .get(&repository)
            .map(RepoState::tip)
            .unwrap_or_else(ChangeSetPosition::initial)
    }

    /// Full history in index order.
    pub fn history(&self, repository: RepositoryId) -> Vec<ChangeSet> {
        self.inner
            .lock()
            .repos
            .get(&repository)
            .map(|r| r.history.iter().map(|(cs, _)| cs.clone()).collect())
            .unwrap_or_default()
    }

    /// Decoded change-set files in index order.
    pub fn change_set_files(&self, repository: RepositoryId) -> Vec<ChangeSetFile> {
        self.inner
            .lock()
            .repos
            .get(&repository)
            .map(|r| {
                r.history
                    .iter()
                    .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names a change-set.
    pub fn name_version(&self, repository: RepositoryId, name: &str, change_set_id: &str) {
        if let Some(repo) = self.inner.lock().repos.get_mut(&repository) {
            repo.named.insert(name.to_string(), change_set_id.to_string());
        }
    }

    /// Publishes a snapshot of the history up to `index`.
    pub fn add_snapshot(&self, repository: RepositoryId, index: u64) {
        let mut inner = self.inner.lock();
        let Some(repo) = inner.repos.get_mut(&repository) else {
            return;
        };
        let files: Vec<ChangeSetFile> = repo
            .history
            .iter()
            .take(index as usize)
            .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
            .collect();
        let position = repo
            .history
            .get((index as usize).wrapping_sub(1))
            .map(|(cs, _)| cs.position())
            .unwrap_or_else(ChangeSetPosition::initial);
        let bytes = ReplicaState::from_history(repository, &files).to_bytes();
        repo.snapshots.push((position, bytes));
    }

    /// Queues an upload failure.
    pub fn fail_next_upload(&self, status: RemoteStatus, commit: bool) {
        self.inner
            .lock()
            .upload_failures
            .push_back(UploadFailure { status, commit });
    }

    /// Queues a code update failure.
    pub fn fail_next_code_update(&self, status: RemoteStatus) {
        self.inner.lock().code_failures.push_back(status);
    }

    /// Makes every replica id request fail with `status`.
    pub fn deny_acquire(&self, status: RemoteStatus) {
        self.inner.lock().deny_acquire = Some(status);
    }

    /// Makes every existence query fail with `status`.
    pub fn fail_replica_exists(&self, status: RemoteStatus) {
        self.inner.lock().exists_failure = Some(status);
    }

    /// Drops an issued replica id without the replica knowing.
    pub fn forget_replica(&self, repository: RepositoryId, replica: ReplicaId) {
        self.inner.lock().replicas.remove(&(repository, replica));
    }

    /// Returns true if `replica` is currently issued.
    pub fn is_issued(&self, repository: RepositoryId, replica: ReplicaId) -> bool {
        self.inner.lock().replicas.contains(&(repository, replica))
    }

    /// Reserves a code for `replica`.
    pub fn claim_code(&self, repository: RepositoryId, code: Code, replica: ReplicaId) {
        if let Some(repo) = self.inner.lock().repos.get_mut(&repository) {
            repo.codes.insert(code, replica);
        }
    }

    /// Owner of a code.
    pub fn code_owner(&self, repository: RepositoryId, code: &Code) -> Option<ReplicaId> {
        self.inner
            .lock()
            .repos
            .get(&repository)
            .and_then(|r| r.codes.get(code).copied())
    }

    /// Returns true if `replica` holds locks from an earlier push.
    pub fn holds_locks(&self, repository: RepositoryId, replica: ReplicaId) -> bool {
        self.inner
            .lock()
            .repos
            .get(&repository)
            .is_some_and(|r| r.locks.contains(&replica))
    }

    /// Calls received so far.
    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }
}

impl RemoteRepository for MemoryRepository {
    async fn list_change_sets(
        &self,
        repository: RepositoryId,
        query: &ChangeSetQuery,
    ) -> RemoteResult<Vec<ChangeSet>> {
        let mut inner = self.inner.lock();
        inner.calls.list += 1;
        let repo = inner.repo(repository)?;
        let all = repo.history.iter().map(|(cs, _)| cs);
        let found = match query {
            ChangeSetQuery::All => all.cloned().collect(),
            ChangeSetQuery::Latest => all.last().cloned().into_iter().collect(),
            ChangeSetQuery::ById(id) => all.filter(|cs| &cs.id == id).cloned().collect(),
            ChangeSetQuery::Between { after, up_to } => {
                let missing = |id: &str| {
                    RemoteError::new(RemoteStatus::ChangeSetDoesNotExist, format!("change-set {id}"))
                };
                let low = repo.index_of(after).ok_or_else(|| missing(after))?;
                let high = repo.index_of(up_to).ok_or_else(|| missing(up_to))?;
                repo.history
                    .iter()
                    .map(|(cs, _)| cs)
                    .filter(|cs| cs.index > low && cs.index <= high)
                    .cloned()
                    .collect()
            }
        };
        Ok(found)
    }

    async fn download_change_sets(
        &self,
        repository: RepositoryId,
        change_sets: &[ChangeSet],
        dir: &Path,
        cancel: &CancellationHandle,
    ) -> RemoteResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.download += 1;
        if cancel.is_cancelled() {
            return Err(RemoteError::new(RemoteStatus::DownloadCancelled, "download cancelled"));
        }
        let mut written = 0;
        {
            let repo = inner.repo(repository)?;
            fs::create_dir_all(dir)
                .map_err(|e| RemoteError::new(RemoteStatus::Network, e.to_string()))?;
            for wanted in change_sets {
                let (cs, bytes) = repo
                    .history
                    .iter()
                    .find(|(cs, _)| cs.id == wanted.id)
                    .ok_or_else(|| {
                        RemoteError::new(
                            RemoteStatus::ChangeSetDoesNotExist,
                            format!("change-set {}", wanted.id),
                        )
                    })?;
                fs::write(dir.join(cs.file_name()), bytes)
                    .map_err(|e| RemoteError::new(RemoteStatus::Network, e.to_string()))?;
                written += 1;
            }
        }
        inner.calls.files_downloaded += written;
        Ok(())
    }

    async fn create_change_set(
        &self,
        repository: RepositoryId,
        change_set: &ChangeSet,
        file: &Path,
    ) -> RemoteResult<ChangeSet> {
        let bytes = fs::read(file)
            .map_err(|e| RemoteError::new(RemoteStatus::OperationFailed, e.to_string()))?;
        let mut inner = self.inner.lock();
        inner.calls.create += 1;
        let failure = inner.upload_failures.pop_front();
        let repo = inner.repo(repository)?;

        if let Some(failure) = failure {
            if failure.commit {
                repo.append(change_set.clone(), bytes);
            }
            return Err(RemoteError::new(failure.status, "injected upload failure"));
        }
        if repo.index_of(&change_set.id).is_some() {
            return Err(RemoteError::new(
                RemoteStatus::ChangeSetAlreadyExists,
                format!("change-set {}", change_set.id),
            ));
        }
        if change_set.parent_id != repo.tip().id {
            return Err(RemoteError::new(
                RemoteStatus::PullIsRequired,
                format!("parent {} is not the tip", change_set.parent_id),
            ));
        }
        if let Some(replica) = change_set.replica_id {
            repo.locks.insert(replica);
        }
        Ok(repo.append(change_set.clone(), bytes))
    }

    async fn download_snapshot(
        &self,
        repository: RepositoryId,
        target: &ChangeSetPosition,
        dest: &Path,
        cancel: &CancellationHandle,
    ) -> RemoteResult<ChangeSetPosition> {
        let mut inner = self.inner.lock();
        inner.calls.snapshot += 1;
        if cancel.is_cancelled() {
            return Err(RemoteError::new(RemoteStatus::DownloadCancelled, "download cancelled"));
        }
        let repo = inner.repo(repository)?;
        let (position, bytes) = repo
            .snapshots
            .iter()
            .filter(|(pos, _)| pos.index <= target.index)
            .max_by_key(|(pos, _)| pos.index)
            .cloned()
            .unwrap_or_else(|| {
                (
                    ChangeSetPosition::initial(),
                    ReplicaState::new(repository, ReplicaId::STANDALONE).to_bytes(),
                )
            });
        fs::write(dest, bytes).map_err(|e| RemoteError::new(RemoteStatus::Network, e.to_string()))?;
        Ok(position)
    }

    async fn named_version(&self, repository: RepositoryId, name: &str) -> RemoteResult<String> {
        let mut inner = self.inner.lock();
        inner.calls.list += 1;
        inner.repo(repository)?.named.get(name).cloned().ok_or_else(|| {
            RemoteError::new(RemoteStatus::NamedVersionDoesNotExist, format!("version {name}"))
        })
    }

    async fn acquire_replica_id(&self, repository: RepositoryId) -> RemoteResult<ReplicaId> {
        let mut inner = self.inner.lock();
        inner.calls.acquire += 1;
        if let Some(status) = inner.deny_acquire {
            return Err(RemoteError::new(status, "replica id denied"));
        }
        inner.repo(repository)?;
        let raw = inner.next_replica.max(ReplicaId::FIRST_VALID.value());
        inner.next_replica = raw + 1;
        let replica = ReplicaId::new(raw);
        inner.replicas.insert((repository, replica));
        Ok(replica)
    }

    async fn release_replica_id(&self, repository: RepositoryId, replica: ReplicaId) -> RemoteResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.release += 1;
        if inner.replicas.remove(&(repository, replica)) {
            Ok(())
        } else {
            Err(RemoteError::new(
                RemoteStatus::BriefcaseDoesNotExist,
                format!("replica {replica}"),
            ))
        }
    }

    async fn replica_exists(&self, repository: RepositoryId, replica: ReplicaId) -> RemoteResult<bool> {
        let mut inner = self.inner.lock();
        inner.calls.exists += 1;
        if let Some(status) = inner.exists_failure {
            return Err(RemoteError::new(status, "existence query failed"));
        }
        Ok(inner.replicas.contains(&(repository, replica)))
    }

    async fn update_codes(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
        codes: &[Code],
        options: CodeUpdateOptions,
    ) -> RemoteResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.update_codes += 1;
        if let Some(status) = inner.code_failures.pop_front() {
            return Err(RemoteError::new(status, "injected code failure"));
        }
        let repo = inner.repo(repository)?;
        let mut conflicts = Vec::new();
        for code in codes {
            match repo.codes.get(code) {
                Some(owner) if *owner != replica => {
                    conflicts.push(code.value.clone());
                    if !options.continue_on_conflict {
                        break;
                    }
                }
                _ => {
                    repo.codes.insert(code.clone(), replica);
                }
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(RemoteError::new(
                RemoteStatus::ConflictingCodes,
                format!("codes held elsewhere: {}", conflicts.join(", ")),
            ))
        }
    }

    async fn delete_all_codes(&self, repository: RepositoryId, replica: ReplicaId) -> RemoteResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.delete_codes += 1;
        inner.repo(repository)?.codes.retain(|_, owner| *owner != replica);
        Ok(())
    }

    async fn delete_all_locks(&self, repository: RepositoryId, replica: ReplicaId) -> RemoteResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.delete_locks += 1;
        inner.repo(repository)?.locks.remove(&replica);
        Ok(())
    }
}
