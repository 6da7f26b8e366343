//! Local cache layout.
//!
//! ```text
//! <root>/
//! ├─ LOCK                                   # Advisory lock, one manager per root
//! └─ <repositoryId>/
//!    ├─ csets/<changeSetId>.cs              # Downloaded change-sets
//!    ├─ <repositoryId>.bim-change-summaries # Change summary cache
//!    ├─ <repositoryId>.bim-changed-elements # Changed elements cache
//!    └─ briefcases/<replicaId>/
//!       ├─ <replicaId>.bim                  # Replica file
//!       ├─ pending-codes.json               # Unconfirmed code reconciliations
//!       └─ rebase/<txnId>.json              # Rebase workspace
//! ```

use crate::error::{SyncError, SyncResult};
use briefsync_protocol::{ReplicaId, RepositoryId};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "LOCK";
const CHANGE_SETS_DIR: &str = "csets";
const BRIEFCASES_DIR: &str = "briefcases";
const REBASE_DIR: &str = "rebase";
const PENDING_CODES_FILE: &str = "pending-codes.json";
/// Extension of replica files.
pub const REPLICA_EXTENSION: &str = "bim";

/// Paths of the local cache.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    root: PathBuf,
}

impl LocalCacheStore {
    /// Creates a store rooted at `root`. Nothing is created on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding everything cached for a repository.
    pub fn repository_dir(&self, repository: RepositoryId) -> PathBuf {
        self.root.join(repository.to_string())
    }

    /// Folder holding downloaded change-set files.
    pub fn change_sets_dir(&self, repository: RepositoryId) -> PathBuf {
        self.repository_dir(repository).join(CHANGE_SETS_DIR)
    }

    /// Folder holding all replicas of a repository.
    pub fn briefcases_dir(&self, repository: RepositoryId) -> PathBuf {
        self.repository_dir(repository).join(BRIEFCASES_DIR)
    }

    /// Folder holding one replica and its auxiliary files.
    pub fn replica_dir(&self, repository: RepositoryId, replica: ReplicaId) -> PathBuf {
        self.briefcases_dir(repository).join(replica.to_string())
    }

    /// Replica file.
    pub fn replica_path(&self, repository: RepositoryId, replica: ReplicaId) -> PathBuf {
        self.replica_dir(repository, replica)
            .join(format!("{replica}.{REPLICA_EXTENSION}"))
    }

    /// Pending code reconciliation file of a replica.
    pub fn pending_codes_path(&self, repository: RepositoryId, replica: ReplicaId) -> PathBuf {
        self.replica_dir(repository, replica).join(PENDING_CODES_FILE)
    }

    /// Rebase workspace of a replica.
    pub fn rebase_dir(&self, repository: RepositoryId, replica: ReplicaId) -> PathBuf {
        self.replica_dir(repository, replica).join(REBASE_DIR)
    }

    /// Change summary cache of a repository.
    pub fn change_summaries_path(&self, repository: RepositoryId) -> PathBuf {
        self.repository_dir(repository)
            .join(format!("{repository}.{REPLICA_EXTENSION}-change-summaries"))
    }

    /// Changed elements cache of a repository.
    pub fn changed_elements_path(&self, repository: RepositoryId) -> PathBuf {
        self.repository_dir(repository)
            .join(format!("{repository}.{REPLICA_EXTENSION}-changed-elements"))
    }

    /// Creates the root and takes the advisory lock.
    ///
    /// # Errors
    ///
    /// Returns `CacheLocked` if another manager holds the root.
    pub fn lock(&self) -> SyncResult<File> {
        fs::create_dir_all(&self.root)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::CacheLocked(self.root.clone()));
        }
        Ok(lock_file)
    }

    /// Candidate replica files of every cached repository.
    pub fn replica_candidates(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for repo_dir in read_dirs(&self.root) {
            for replica_dir in read_dirs(&repo_dir.join(BRIEFCASES_DIR)) {
                let Ok(entries) = fs::read_dir(&replica_dir) else {
                    continue;
                };
                found.extend(entries.filter_map(Result::ok).map(|e| e.path()).filter(|p| {
                    p.is_file() && p.extension().is_some_and(|ext| ext == REPLICA_EXTENSION)
                }));
            }
        }
        found.sort();
        found
    }
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Deletes a file. Never fails: problems are logged and reported as `false`.
pub fn delete_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot delete file");
            false
        }
    }
}

/// Deletes a folder and its contents. Never fails: problems are logged and
/// reported as `false`.
pub fn delete_folder(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted folder");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot delete folder");
            false
        }
    }
}

/// Deletes a folder only if it has no entries left.
pub fn delete_folder_if_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none() && delete_folder(path),
        Err(_) => false,
    }
}

/// Writes `data` next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> SyncResult<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("tmp");
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    Ok(())
}
