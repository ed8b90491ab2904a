//! Data directory layout.
//!
//! ```text
//! <data_dir>/
//!   index.db            single-file index store
//!   models/             embedding model artifacts cache
//!   repair_hints/       breadcrumbs for deferred index repair
//!   repos/<key>/        per-repository state
//!     .capture.lock     advisory capture lock
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

/// Resolved filesystem layout under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirLayout {
    root: PathBuf,
}

impl DataDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the single-file index store.
    pub fn index_db(&self) -> PathBuf {
        self.root.join("index.db")
    }

    /// Cache directory for embedding model artifacts.
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    /// Directory holding repair-hint breadcrumbs.
    pub fn repair_hints_dir(&self) -> PathBuf {
        self.root.join("repair_hints")
    }

    /// Per-repository state directory.
    ///
    /// The key combines the repo's directory name with a hash of its full
    /// canonical path, so distinct checkouts never collide while the
    /// directory stays recognizable.
    pub fn repo_dir(&self, repo_path: &Path) -> PathBuf {
        let name = repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let mut hasher = DefaultHasher::new();
        repo_path.hash(&mut hasher);
        self.root
            .join("repos")
            .join(format!("{name}-{:016x}", hasher.finish()))
    }

    /// The advisory capture lock file for a repository.
    pub fn capture_lock(&self, repo_path: &Path) -> PathBuf {
        self.repo_dir(repo_path).join(".capture.lock")
    }

    /// Create every directory in the layout.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.models_dir())?;
        std::fs::create_dir_all(self.repair_hints_dir())?;
        Ok(())
    }
}
