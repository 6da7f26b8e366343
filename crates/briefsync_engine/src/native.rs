//! Native database abstraction.
//!
//! The embedded database that actually applies change-set files is opaque
//! to the engine. `NativeEngine` covers the file-level entry points (open,
//! header peek, batch apply on a closed file); `NativeReplica` is one open
//! handle.

use briefsync_protocol::{
    ApplyOption, ApplyRequest, ApplyResponse, ApplyStatus, ChangeSet, ChangeSetToken, Code,
    OpenMode, PendingTxn, ReplicaHeader, ReplicaId, SchemaDelta,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for native calls.
pub type NativeResult<T> = Result<T, NativeError>;

/// Error reported by the native database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("native error {code}: {message}")]
pub struct NativeError {
    /// Native status code.
    pub code: i32,
    /// Diagnostic message.
    pub message: String,
}

impl NativeError {
    /// Creates an error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A change-set written locally from pending transactions, not yet pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChangeSet {
    /// Content hash of the new change-set.
    pub id: String,
    /// The replica's parent at creation time.
    pub parent_id: String,
    /// File holding the change-set.
    pub pathname: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    /// Whether any pending transaction imported schema.
    pub contains_schema: bool,
}

/// An open handle on a replica file.
pub trait NativeReplica: Send + 'static {
    /// Path of the replica file.
    fn path(&self) -> &Path;

    /// Returns true while the handle is open.
    fn is_open(&self) -> bool;

    /// Mode the handle was last opened in.
    fn open_mode(&self) -> OpenMode;

    /// Reads the identity header.
    fn header(&self) -> NativeResult<ReplicaHeader>;

    /// Closes the handle, leaving the file in place.
    fn close(&mut self);

    /// Reopens a closed handle.
    fn reopen(&mut self, mode: OpenMode) -> NativeResult<()>;

    /// Applies a single change-set.
    fn apply_change_set(&mut self, token: &ChangeSetToken, option: ApplyOption) -> ApplyStatus;

    /// Rewrites the replica id stored in the header.
    fn set_replica_id(&mut self, id: ReplicaId) -> NativeResult<()>;

    /// Returns true if there are edits not yet committed to a transaction.
    fn has_unsaved_changes(&self) -> bool;

    /// Returns true if there are committed transactions not yet pushed.
    fn has_pending_txns(&self) -> bool;

    /// Writes pending transactions to a new change-set file.
    fn start_create_change_set(&mut self) -> NativeResult<LocalChangeSet>;

    /// Marks the created change-set as pushed and makes it the parent.
    fn finish_create_change_set(&mut self, change_set: &ChangeSet) -> NativeResult<()>;

    /// Discards a change-set from `start_create_change_set`.
    fn abandon_create_change_set(&mut self);

    /// Pending local transactions in commit order.
    fn pending_txns(&self) -> NativeResult<Vec<PendingTxn>>;

    /// Undoes and drops all pending local transactions.
    fn discard_pending_txns(&mut self) -> NativeResult<()>;

    /// Re-applies a transaction as a new pending local transaction.
    fn replay_txn(&mut self, txn: &PendingTxn) -> NativeResult<()>;

    /// Imports a schema delta as a new pending local transaction.
    fn import_schema(&mut self, delta: &SchemaDelta) -> NativeResult<()>;

    /// Current version of a schema, if present.
    fn schema_version(&self, schema: &str) -> Option<u32>;
}

/// File-level entry points of the native database.
pub trait NativeEngine: Send + Sync + 'static {
    /// Handle type.
    type Replica: NativeReplica;

    /// Opens a replica file.
    fn open(&self, path: &Path, mode: OpenMode) -> NativeResult<Self::Replica>;

    /// Opens read-only just far enough to read the identity header.
    fn read_header(&self, path: &Path) -> NativeResult<ReplicaHeader>;

    /// Applies a batch to a closed replica file. Long running; called from
    /// a blocking worker.
    fn apply_batch(&self, path: &Path, request: &ApplyRequest) -> ApplyResponse;

    /// Extracts the codes a change-set file reserves.
    fn extract_codes(&self, file: &Path) -> NativeResult<Vec<Code>>;

    /// Extracts the schema delta of a change-set file, if it carries one.
    fn read_schema_delta(&self, token: &ChangeSetToken) -> NativeResult<Option<SchemaDelta>>;
}
