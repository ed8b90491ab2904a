//! Per-repository advisory capture lock.
//!
//! Cross-process exclusion is a lock file created with `create_new`
//! (atomic O_CREAT|O_EXCL, which also refuses to follow a symlink at the
//! final component). Acquisition polls until a deadline; stale locks left
//! by dead processes are detected by age and broken.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Poll interval while waiting for the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A lock older than this is assumed to belong to a dead process.
const STALE_AFTER: Duration = Duration::from_secs(600);

/// Held capture lock; dropping releases it.
#[derive(Debug)]
pub struct CaptureLock {
    path: PathBuf,
}

impl CaptureLock {
    /// Acquire the lock at `path`, polling up to `timeout`.
    pub async fn acquire(path: &Path, timeout: Duration) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(mnemo_notes::StorageError::Io)?;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Self::try_create(path) {
                Ok(()) => {
                    debug!(lock = %path.display(), "capture lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Self::break_if_stale(path);
                }
                Err(e) => return Err(mnemo_notes::StorageError::Io(e).into()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::LockTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One exclusive creation attempt, owner-only permissions.
    fn try_create(path: &Path) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(())
    }

    /// Remove the lock file if its mtime says the holder is long gone.
    fn break_if_stale(path: &Path) {
        let stale = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(|mtime| {
                SystemTime::now()
                    .duration_since(mtime)
                    .map(|age| age > STALE_AFTER)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if stale {
            warn!(lock = %path.display(), "breaking stale capture lock");
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for CaptureLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to remove capture lock");
        }
    }
}
