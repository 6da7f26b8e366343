//! Reverse / reinstate / merge planning.
//!
//! Reversal and reinstatement navigate history the replica has already
//! applied. Anything past the parent's forward edge needs new change-sets
//! and is a merge. When several phases are required they always run in the
//! order reverse, reinstate, merge: reinstating stops at the parent, so a
//! merge can only start once the replica has caught up with its own parent.

use crate::changeset::ChangeSetPosition;
use crate::error::{ProtocolError, ProtocolResult};
use crate::interchange::ApplyOption;

/// Where a replica currently stands in the history.
///
/// # Invariants
///
/// - `reversed.index <= parent.index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPosition {
    parent: ChangeSetPosition,
    reversed: Option<ChangeSetPosition>,
}

impl ReplicaPosition {
    /// Creates a position, checking the reversed/parent invariant.
    pub fn new(
        parent: ChangeSetPosition,
        reversed: Option<ChangeSetPosition>,
    ) -> ProtocolResult<Self> {
        if let Some(rev) = &reversed {
            if rev.index > parent.index {
                return Err(ProtocolError::ReversedPastParent {
                    parent: parent.index,
                    reversed: rev.index,
                });
            }
        }
        Ok(Self { parent, reversed })
    }

    /// A replica with no reversed state.
    pub fn at(parent: ChangeSetPosition) -> Self {
        Self {
            parent,
            reversed: None,
        }
    }

    /// Last change-set applied going forward.
    pub fn parent(&self) -> &ChangeSetPosition {
        &self.parent
    }

    /// Reversed position, if the replica is rolled back.
    pub fn reversed(&self) -> Option<&ChangeSetPosition> {
        self.reversed.as_ref()
    }

    /// The visible position: reversed if set, parent otherwise.
    pub fn current(&self) -> &ChangeSetPosition {
        self.reversed.as_ref().unwrap_or(&self.parent)
    }
}

/// Phases needed to move a replica to a target position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    /// Already at the target.
    NoOp,
    /// Roll back to an earlier point.
    Reverse {
        /// Target of the reversal.
        to: ChangeSetPosition,
    },
    /// Roll forward within already-applied history.
    Reinstate {
        /// Target of the reinstatement.
        to: ChangeSetPosition,
    },
    /// Reinstate up to the parent, then merge new change-sets.
    ReinstateThenMerge {
        /// Always the replica's parent.
        reinstate_to: ChangeSetPosition,
        /// Final target.
        merge_to: ChangeSetPosition,
    },
    /// Apply new change-sets past the parent.
    Merge {
        /// Target of the merge.
        to: ChangeSetPosition,
    },
}

impl SyncPlan {
    /// Computes the plan for moving `position` to `target`.
    pub fn compute(position: &ReplicaPosition, target: &ChangeSetPosition) -> Self {
        let parent = &position.parent;

        if let Some(reversed) = &position.reversed {
            if target.index < reversed.index {
                return SyncPlan::Reverse { to: target.clone() };
            }
            if target.index > reversed.index {
                if target.index > parent.index {
                    return SyncPlan::ReinstateThenMerge {
                        reinstate_to: parent.clone(),
                        merge_to: target.clone(),
                    };
                }
                return SyncPlan::Reinstate { to: target.clone() };
            }
            return SyncPlan::NoOp;
        }

        match target.index.cmp(&parent.index) {
            std::cmp::Ordering::Less => SyncPlan::Reverse { to: target.clone() },
            std::cmp::Ordering::Greater => SyncPlan::Merge { to: target.clone() },
            std::cmp::Ordering::Equal => SyncPlan::NoOp,
        }
    }

    /// Phases in execution order.
    pub fn steps(&self) -> Vec<(ApplyOption, &ChangeSetPosition)> {
        match self {
            SyncPlan::NoOp => Vec::new(),
            SyncPlan::Reverse { to } => vec![(ApplyOption::Reverse, to)],
            SyncPlan::Reinstate { to } => vec![(ApplyOption::Reinstate, to)],
            SyncPlan::ReinstateThenMerge {
                reinstate_to,
                merge_to,
            } => vec![
                (ApplyOption::Reinstate, reinstate_to),
                (ApplyOption::Merge, merge_to),
            ],
            SyncPlan::Merge { to } => vec![(ApplyOption::Merge, to)],
        }
    }

    /// Returns true if the plan does nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self, SyncPlan::NoOp)
    }
}
