//! Remote repository abstraction.
//!
//! The remote authority owns the change-set history, issues replica ids and
//! arbitrates codes and locks. This trait abstracts the network client so
//! the engine can run against a hosted service, a loopback server or an
//! in-memory double.

use briefsync_protocol::{
    ChangeSet, ChangeSetPosition, Code, CodeUpdateOptions, ReplicaId, RepositoryId,
};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Status reported by the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteStatus {
    /// A change-set with this id is already in the history.
    ChangeSetAlreadyExists,
    /// The requested change-set is unknown.
    ChangeSetDoesNotExist,
    /// Another replica is pushing right now.
    AnotherUserPushing,
    /// The pusher's parent is not the latest change-set.
    PullIsRequired,
    /// The repository is briefly locked by the service.
    DatabaseTemporarilyLocked,
    /// A transient server-side failure.
    OperationFailed,
    /// A code is reserved by another replica.
    ConflictingCodes,
    /// The replica id is not registered.
    BriefcaseDoesNotExist,
    /// The named version is unknown.
    NamedVersionDoesNotExist,
    /// Caller lacks permission.
    UserDoesNotHavePermission,
    /// Caller already holds the maximum number of replica ids.
    MaximumNumberOfBriefcasesPerUser,
    /// Authentication failed or expired.
    Unauthorized,
    /// A transfer was cancelled by the caller.
    DownloadCancelled,
    /// Connection-level failure.
    Network,
    /// Anything else.
    Unknown,
}

impl RemoteStatus {
    /// Statuses after which a push may be attempted again.
    pub fn is_push_retryable(&self) -> bool {
        matches!(
            self,
            RemoteStatus::AnotherUserPushing
                | RemoteStatus::PullIsRequired
                | RemoteStatus::DatabaseTemporarilyLocked
                | RemoteStatus::OperationFailed
        )
    }

    /// Statuses meaning "the thing is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RemoteStatus::ChangeSetDoesNotExist
                | RemoteStatus::BriefcaseDoesNotExist
                | RemoteStatus::NamedVersionDoesNotExist
        )
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error returned by a remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct RemoteError {
    /// Remote status.
    pub status: RemoteStatus,
    /// Server message.
    pub message: String,
}

impl RemoteError {
    /// Creates an error.
    pub fn new(status: RemoteStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Selection of change-sets to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSetQuery {
    /// The whole history.
    All,
    /// Only the most recent change-set.
    Latest,
    /// The change-set with this id.
    ById(String),
    /// Change-sets after `after` (exclusive, empty = from the start) up to
    /// and including `up_to`.
    Between {
        /// Exclusive lower bound.
        after: String,
        /// Inclusive upper bound.
        up_to: String,
    },
}

/// Cooperative cancellation for transfers.
///
/// Clones share the same flag. Applies are never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Creates an un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Client for the remote authority of a repository.
///
/// Implementations must tolerate concurrent callers from many replicas; the
/// engine treats "someone else changed it first" as an ordinary outcome.
pub trait RemoteRepository: Send + Sync + 'static {
    /// Lists change-sets ordered by index.
    fn list_change_sets(
        &self,
        repository: RepositoryId,
        query: &ChangeSetQuery,
    ) -> impl Future<Output = RemoteResult<Vec<ChangeSet>>> + Send;

    /// Downloads change-set files into `dir`, named by `ChangeSet::file_name`.
    fn download_change_sets(
        &self,
        repository: RepositoryId,
        change_sets: &[ChangeSet],
        dir: &Path,
        cancel: &CancellationHandle,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Uploads a locally created change-set. Returns the record with the
    /// remote-assigned index.
    fn create_change_set(
        &self,
        repository: RepositoryId,
        change_set: &ChangeSet,
        file: &Path,
    ) -> impl Future<Output = RemoteResult<ChangeSet>> + Send;

    /// Downloads the newest snapshot at or before `target` into `dest` and
    /// returns the position it represents.
    fn download_snapshot(
        &self,
        repository: RepositoryId,
        target: &ChangeSetPosition,
        dest: &Path,
        cancel: &CancellationHandle,
    ) -> impl Future<Output = RemoteResult<ChangeSetPosition>> + Send;

    /// Returns the change-set id a named version points at.
    fn named_version(
        &self,
        repository: RepositoryId,
        name: &str,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    /// Reserves a new replica id.
    fn acquire_replica_id(
        &self,
        repository: RepositoryId,
    ) -> impl Future<Output = RemoteResult<ReplicaId>> + Send;

    /// Releases a replica id reservation.
    fn release_replica_id(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Returns true if the replica id is currently reserved.
    fn replica_exists(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
    ) -> impl Future<Output = RemoteResult<bool>> + Send;

    /// Claims codes for a replica.
    fn update_codes(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
        codes: &[Code],
        options: CodeUpdateOptions,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Releases every code held by a replica.
    fn delete_all_codes(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Releases every lock held by a replica.
    fn delete_all_locks(
        &self,
        repository: RepositoryId,
        replica: ReplicaId,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}
