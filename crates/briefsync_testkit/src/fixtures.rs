//! Test fixtures and manager helpers.
//!
//! Provides a manager wired to an in-memory remote and the simulated native
//! engine over a temporary cache root, plus helpers for seeding history.

use crate::native::{
    property_key, ChangeSetFile, RecordOp, Records, ReplicaState, SimulatedEngine, SimulatedReplica,
};
use crate::remote::MemoryRepository;
use briefsync_engine::{Briefcase, BriefcaseManager, CancellationHandle, ManagerConfig, RetryConfig};
use briefsync_protocol::{ChangeSet, RepositoryId, VersionRef};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Manager type used throughout the tests.
pub type TestManager = BriefcaseManager<MemoryRepository, SimulatedEngine>;

/// Briefcase type used throughout the tests.
pub type TestBriefcase = Briefcase<SimulatedReplica>;

/// Installs a test-friendly tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A manager over a temporary cache root.
pub struct TestEnv {
    /// The manager.
    pub manager: TestManager,
    /// The engine handed to the manager; shares controls with it.
    pub engine: SimulatedEngine,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestEnv {
    /// Creates an environment with near-zero push retry delays.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates an environment, letting the caller adjust the configuration.
    pub fn with_config(adjust: impl FnOnce(ManagerConfig) -> ManagerConfig) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = adjust(
            ManagerConfig::new(temp_dir.path().join("cache")).with_push_retry(
                RetryConfig::new(5).with_delays(Duration::ZERO, Duration::from_millis(2)),
            ),
        );
        let engine = SimulatedEngine::new();
        let manager = BriefcaseManager::init(config, MemoryRepository::new(), engine.clone())
            .expect("Failed to initialize manager");
        Self {
            manager,
            engine,
            _temp_dir: temp_dir,
        }
    }

    /// The in-memory remote.
    pub fn remote(&self) -> &MemoryRepository {
        self.manager.remote()
    }

    /// Cache root.
    pub fn cache_root(&self) -> &Path {
        self.manager.config().cache_dir()
    }

    /// A scratch path outside the cache.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self._temp_dir.path().join(name)
    }

    /// Creates a repository with `count` data change-sets.
    ///
    /// Change-set `i` sets `e0.Pump.flow` to `i` and adds element `e{i}`
    /// with `Pump.label = "L{i}"`.
    pub fn seed_repository(&self, count: u64) -> (RepositoryId, Vec<ChangeSet>) {
        let repository = self.remote().create_repository();
        let history = (1..=count)
            .map(|i| self.remote().append_ops(repository, seed_ops(i)))
            .collect();
        (repository, history)
    }

    /// Records expected after merging the first `index` change-sets.
    pub fn records_at(&self, repository: RepositoryId, index: u64) -> Records {
        let files: Vec<ChangeSetFile> = self
            .remote()
            .change_set_files(repository)
            .into_iter()
            .take(index as usize)
            .collect();
        ReplicaState::from_history(repository, &files).records
    }

    /// Downloads a new briefcase at `version`.
    pub async fn download(&self, repository: RepositoryId, version: &VersionRef) -> TestBriefcase {
        self.manager
            .download(repository, version, &CancellationHandle::new())
            .await
            .expect("Failed to download briefcase")
    }
}

/// Records of an open briefcase.
pub fn records_of(briefcase: &TestBriefcase) -> Records {
    briefcase
        .handle()
        .state()
        .expect("briefcase is closed")
        .records
        .clone()
}

/// Version reference for the state after `index` change-sets of `history`.
pub fn version_at(history: &[ChangeSet], index: u64) -> VersionRef {
    match index {
        0 => VersionRef::First,
        i => VersionRef::as_of(history[i as usize - 1].id.clone()),
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Record writes of seeded change-set `i`.
pub fn seed_ops(i: u64) -> Vec<RecordOp> {
    let before = (i > 1).then(|| json!(i - 1));
    vec![
        RecordOp::set("e0", "Pump", "flow", before, json!(i)),
        RecordOp {
            element_id: format!("e{i}"),
            key: property_key("Pump", "label"),
            before: None,
            after: Some(json!(format!("L{i}"))),
        },
    ]
}
