//! The briefcase manager context.

use crate::cache::LocalCacheStore;
use crate::config::ManagerConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::native::{NativeEngine, NativeReplica};
use crate::remote::RemoteRepository;
use briefsync_protocol::{ReplicaHeader, ReplicaId, RepositoryId};
use fs2::FileExt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// An open local replica.
///
/// Operations on one briefcase take `&mut Briefcase`, so a briefcase is
/// driven by one task at a time.
#[derive(Debug)]
pub struct Briefcase<H: NativeReplica> {
    repository_id: RepositoryId,
    replica_id: ReplicaId,
    handle: H,
}

impl<H: NativeReplica> Briefcase<H> {
    /// Wraps an open native handle.
    pub fn new(repository_id: RepositoryId, replica_id: ReplicaId, handle: H) -> Self {
        Self {
            repository_id,
            replica_id,
            handle,
        }
    }

    /// Repository of the replica.
    pub fn repository_id(&self) -> RepositoryId {
        self.repository_id
    }

    /// Replica id.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Replica file.
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Reads the identity header.
    pub fn header(&self) -> SyncResult<ReplicaHeader> {
        Ok(self.handle.header()?)
    }

    /// The native handle.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// The native handle, mutably.
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Consumes the briefcase, returning the handle.
    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Process-wide context for synchronizing briefcases.
///
/// Created once with `init` and passed to every operation; `shutdown`
/// releases the cache lock. Owns the remote client, the native engine, the
/// cache layout and the event bus.
pub struct BriefcaseManager<R: RemoteRepository, N: NativeEngine> {
    pub(crate) config: ManagerConfig,
    pub(crate) cache: LocalCacheStore,
    pub(crate) remote: Arc<R>,
    pub(crate) native: Arc<N>,
    pub(crate) events: EventBus,
    lock: File,
}

impl<R: RemoteRepository, N: NativeEngine> BriefcaseManager<R, N> {
    /// Creates the cache root, locks it, and builds the context.
    ///
    /// # Errors
    ///
    /// Returns `CacheLocked` if another manager owns the cache root.
    pub fn init(config: ManagerConfig, remote: R, native: N) -> SyncResult<Self> {
        let cache = LocalCacheStore::new(config.cache_dir.clone());
        let lock = cache.lock()?;
        let events = EventBus::new(config.event_capacity);
        info!(cache = %cache.root().display(), "briefcase manager initialized");

        Ok(Self {
            config,
            cache,
            remote: Arc::new(remote),
            native: Arc::new(native),
            events,
            lock,
        })
    }

    /// Releases the cache lock.
    pub fn shutdown(self) -> SyncResult<()> {
        self.lock.unlock().map_err(SyncError::Io)?;
        info!(cache = %self.cache.root().display(), "briefcase manager shut down");
        Ok(())
    }

    /// The configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The cache layout.
    pub fn cache(&self) -> &LocalCacheStore {
        &self.cache
    }

    /// The remote client.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The native engine.
    pub fn native(&self) -> &N {
        &self.native
    }

    /// Subscribes to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
