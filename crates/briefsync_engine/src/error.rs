//! Error types for the briefcase manager.

use crate::native::NativeError;
use crate::remote::{RemoteError, RemoteStatus};
use briefsync_protocol::{ApplyStatus, ProtocolError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for manager operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a `SyncError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A version, change-set or replica could not be resolved.
    NotFound,
    /// Wrong open mode, unsaved changes, or another broken precondition.
    InvalidState,
    /// The native applier failed, or the replica could not be reopened.
    ApplyError,
    /// Another writer got there first; a push may retry.
    Contention,
    /// A code is held by another replica.
    ConflictingCodes,
    /// The remote refused to issue a replica id.
    CannotAcquire,
    /// Any other remote failure.
    Remote,
    /// Local I/O failure.
    Io,
    /// A persisted file could not be encoded or decoded.
    Serialization,
    /// The caller cancelled a transfer.
    Cancelled,
    /// Concurrent schema changes need caller intervention.
    RebaseConflict,
}

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Version, change-set or replica not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation attempted in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Change-set application failed.
    #[error("apply failed: {message}")]
    Apply {
        /// Description of the failure.
        message: String,
        /// Native status, when the applier returned one.
        status: Option<ApplyStatus>,
    },

    /// Remote contention; retryable by the push orchestrator.
    #[error("remote contention: {0}")]
    Contention(RemoteError),

    /// Codes are reserved by another replica.
    #[error("conflicting codes: {0}")]
    ConflictingCodes(RemoteError),

    /// The remote denied a new replica id.
    #[error("cannot acquire replica id: {0}")]
    CannotAcquire(RemoteError),

    /// Other remote failure.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Native database failure outside of change-set application.
    #[error("native error: {0}")]
    Native(#[from] NativeError),

    /// Invalid protocol value.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error in a persisted file.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cache root is locked by another manager.
    #[error("cache directory locked: {}", .0.display())]
    CacheLocked(PathBuf),

    /// Incompatible concurrent schema changes.
    #[error("rebase conflict: {0}")]
    RebaseConflict(String),

    /// A transfer was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates an apply error.
    pub fn apply(message: impl Into<String>, status: Option<ApplyStatus>) -> Self {
        Self::Apply {
            message: message.into(),
            status,
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::InvalidState(_) | SyncError::CacheLocked(_) => ErrorKind::InvalidState,
            SyncError::Apply { .. } => ErrorKind::ApplyError,
            SyncError::Contention(_) => ErrorKind::Contention,
            SyncError::ConflictingCodes(_) => ErrorKind::ConflictingCodes,
            SyncError::CannotAcquire(_) => ErrorKind::CannotAcquire,
            SyncError::Remote(_) => ErrorKind::Remote,
            SyncError::Native(_) => ErrorKind::InvalidState,
            SyncError::Protocol(_) => ErrorKind::InvalidState,
            SyncError::Io(_) => ErrorKind::Io,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::RebaseConflict(_) => ErrorKind::RebaseConflict,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if a push may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Contention(_))
    }

    /// Returns the remote status, if the error came from the remote.
    pub fn remote_status(&self) -> Option<RemoteStatus> {
        match self {
            SyncError::Contention(e)
            | SyncError::ConflictingCodes(e)
            | SyncError::CannotAcquire(e)
            | SyncError::Remote(e) => Some(e.status),
            _ => None,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.status {
            status if status.is_push_retryable() => SyncError::Contention(err),
            RemoteStatus::ConflictingCodes => SyncError::ConflictingCodes(err),
            RemoteStatus::ChangeSetDoesNotExist | RemoteStatus::NamedVersionDoesNotExist => {
                SyncError::NotFound(err.message)
            }
            RemoteStatus::DownloadCancelled => SyncError::Cancelled,
            _ => SyncError::Remote(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_are_classified() {
        let err: SyncError = RemoteError::new(RemoteStatus::AnotherUserPushing, "busy").into();
        assert_eq!(err.kind(), ErrorKind::Contention);
        assert!(err.is_retryable());

        let err: SyncError = RemoteError::new(RemoteStatus::ConflictingCodes, "taken").into();
        assert_eq!(err.kind(), ErrorKind::ConflictingCodes);
        assert!(!err.is_retryable());

        let err: SyncError = RemoteError::new(RemoteStatus::ChangeSetDoesNotExist, "cs9").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: SyncError = RemoteError::new(RemoteStatus::Unauthorized, "expired").into();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(err.remote_status(), Some(RemoteStatus::Unauthorized));
        assert!(!err.is_retryable());

        let err: SyncError = RemoteError::new(RemoteStatus::DownloadCancelled, "stop").into();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn error_display() {
        let err = SyncError::apply("reopen failed", Some(ApplyStatus(7)));
        assert_eq!(err.to_string(), "apply failed: reopen failed");
        assert_eq!(err.kind(), ErrorKind::ApplyError);

        let err = SyncError::invalid_state("unsaved changes");
        assert!(err.to_string().contains("unsaved changes"));
    }
}
