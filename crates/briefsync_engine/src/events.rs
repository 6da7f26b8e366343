//! Notifications published by the manager.

use briefsync_protocol::{ApplyOption, ChangeSet, ChangeSetPosition, ReplicaId, RepositoryId};
use tokio::sync::broadcast;

/// An event raised after a manager operation, before control returns to
/// the caller of that operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A batch of change-sets was applied (or failed to apply) to a replica.
    Applied {
        /// Repository.
        repository: RepositoryId,
        /// Replica.
        replica: ReplicaId,
        /// Direction of the batch.
        option: ApplyOption,
        /// Last change-set of the batch.
        position: ChangeSetPosition,
        /// Whether the batch applied completely.
        success: bool,
    },
    /// A change-set was accepted by the remote.
    Pushed {
        /// Repository.
        repository: RepositoryId,
        /// Replica that pushed.
        replica: ReplicaId,
        /// The accepted change-set.
        change_set: ChangeSet,
    },
}

/// Fan-out of `SyncEvent`s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}
