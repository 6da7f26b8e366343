//! # briefsync protocol
//!
//! Value types shared by the briefsync engine and its collaborators.
//!
//! This crate provides:
//! - `ChangeSet`, `ChangeSetToken` and `ChangeSetPosition`
//! - Replica and repository identities
//! - `VersionRef` for naming a point in the change-set history
//! - `SyncPlan`, the pure reverse/reinstate/merge planner
//! - Typed interchange structs for the native change-set applier
//! - Codes, schema deltas and pending local transactions
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod codes;
mod error;
mod interchange;
mod plan;
mod replica;
mod schema;
mod version;

pub use changeset::{ChangeSet, ChangeSetPosition, ChangeSetToken, ChangeSetType};
pub use codes::{Code, CodeUpdateOptions};
pub use error::{ProtocolError, ProtocolResult};
pub use interchange::{ApplyOption, ApplyRequest, ApplyResponse, ApplyStatus};
pub use plan::{ReplicaPosition, SyncPlan};
pub use replica::{OpenMode, ReplicaHeader, ReplicaId, RepositoryId};
pub use schema::{
    PendingTxn, PropertyType, PropertyValue, RecordChange, SchemaChange, SchemaDelta, TxnPayload,
};
pub use version::VersionRef;
