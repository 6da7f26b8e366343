//! # Briefsync Engine
//!
//! Briefcase manager for replicas of a versioned repository.
//!
//! This crate provides:
//! - Version resolution against the remote change-set history
//! - Reverse, reinstate and merge planning and execution
//! - A bridge to the native change-set applier (on-task or blocking worker)
//! - Push with bounded retry on contention
//! - Code and lock reconciliation with a durable pending set
//! - Replica download, enumeration and deletion
//! - Semantic rebase of pending local transactions over schema changes
//!
//! ## Architecture
//!
//! A `BriefcaseManager` owns the cache root, the remote client and the
//! native engine. Every operation takes the manager plus a
//! `&mut Briefcase`, so one replica is driven by one task at a time.
//!
//! ## Key Invariants
//!
//! - Change-sets are ordered by index, never by id
//! - Phases run reverse, then reinstate, then merge
//! - A replica's parent is the last change-set applied going forward
//! - Pending code ids are cleared only on success or conflict

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod cache;
mod config;
mod error;
mod events;
mod lifecycle;
mod manager;
mod native;
mod push;
mod rebase;
mod reconcile;
mod remote;
mod resolver;
mod sync;

pub use applier::needs_async_apply;
pub use cache::{delete_file, delete_folder, delete_folder_if_empty, LocalCacheStore, REPLICA_EXTENSION};
pub use config::{
    ManagerConfig, RetryConfig, DEFAULT_ASYNC_APPLY_THRESHOLD, DEFAULT_RECONCILE_BATCH_LIMIT,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use lifecycle::{DeleteOutcome, LocalBriefcaseProps};
pub use manager::{Briefcase, BriefcaseManager};
pub use native::{LocalChangeSet, NativeEngine, NativeError, NativeReplica, NativeResult};
pub use push::PushOutcome;
pub use rebase::{classify, combine_deltas, merge_schemas, RebaseReport, RebaseState, RebaseWorkspace};
pub use reconcile::{PendingCodeSet, ReconcileOutcome, ReconcileSummary};
pub use remote::{
    CancellationHandle, ChangeSetQuery, RemoteError, RemoteRepository, RemoteResult, RemoteStatus,
};
pub use resolver::VersionResolver;
pub use sync::PullOutcome;
