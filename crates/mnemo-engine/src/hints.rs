//! Repair hints.
//!
//! When capture appends a note to git but fails to index it, it leaves a
//! JSON breadcrumb under `repair_hints/`. Sync consumes them and forces a
//! re-scan of the named notes, whether or not their blob sha changed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One pending repair: a note that is in git but (maybe) not in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairHint {
    pub repo_path: PathBuf,
    pub commit_sha: String,
    pub namespace: String,
    pub id: String,
}

/// Write a hint file. Failures are logged, never propagated: the hint is a
/// best-effort breadcrumb on a path that is already degraded.
pub fn write(dir: &Path, hint: &RepairHint) {
    let result = std::fs::create_dir_all(dir).and_then(|()| {
        let name = format!("{}.json", hint.id.replace([':', '/'], "_"));
        let payload = serde_json::to_vec_pretty(hint).unwrap_or_default();
        std::fs::write(dir.join(name), payload)
    });
    match result {
        Ok(()) => debug!(id = %hint.id, "repair hint written"),
        Err(e) => warn!(id = %hint.id, error = %e, "failed to write repair hint"),
    }
}

/// Read and remove every hint for a repository.
pub fn take_for_repo(dir: &Path, repo_path: &Path) -> Vec<RepairHint> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut hints = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<RepairHint>(&bytes) {
            Ok(hint) if hint.repo_path == repo_path => {
                let _ = std::fs::remove_file(&path);
                hints.push(hint);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable repair hint, discarding");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(repo: &str, id: &str) -> RepairHint {
        RepairHint {
            repo_path: repo.into(),
            commit_sha: "abc1234".into(),
            namespace: "decisions".into(),
            id: id.into(),
        }
    }

    #[test]
    fn write_and_take_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("repair_hints");

        write(&dir, &hint("/repo/a", "decisions:abc1234:0"));
        write(&dir, &hint("/repo/a", "decisions:abc1234:1"));
        write(&dir, &hint("/repo/b", "decisions:abc1234:0"));

        let mut taken = take_for_repo(&dir, Path::new("/repo/a"));
        taken.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].id, "decisions:abc1234:0");

        // Taking consumes; repo b's hint is untouched.
        assert!(take_for_repo(&dir, Path::new("/repo/a")).is_empty());
        assert_eq!(take_for_repo(&dir, Path::new("/repo/b")).len(), 1);
    }

    #[test]
    fn garbage_hints_are_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("repair_hints");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("junk.json"), b"not json at all").unwrap();

        assert!(take_for_repo(&dir, Path::new("/repo/a")).is_empty());
        assert!(!dir.join("junk.json").exists());
    }

    #[test]
    fn missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(take_for_repo(&tmp.path().join("nope"), Path::new("/r")).is_empty());
    }
}
