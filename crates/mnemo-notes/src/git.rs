//! Sanitized git-notes storage.
//!
//! Every memory lives in a note under `refs/notes/<prefix>/<namespace>`.
//! This module is the only place that talks to git: all invocations use
//! argument vectors (no shell), carry a wall-clock timeout, and every
//! caller-supplied sha or path passes sanitization first. Notes are only
//! ever appended or removed; history is never rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use mnemo_types::{CommitInfo, Namespace};

use crate::codec;
use crate::error::{StorageError, StorageResult};

/// Caps applied to batched file reads.
#[derive(Debug, Clone, Copy)]
pub struct FileReadLimits {
    /// Maximum number of files returned per call.
    pub max_files: usize,
    /// Maximum bytes per file; larger blobs are skipped with a warning.
    pub max_file_bytes: usize,
    /// Maximum bytes across the whole batch.
    pub max_total_bytes: usize,
}

impl Default for FileReadLimits {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_file_bytes: 102_400,
            max_total_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Result of a batched file read: whatever fit under the caps, plus
/// warnings for what did not.
#[derive(Debug, Default)]
pub struct FileBatch {
    pub files: BTreeMap<String, Vec<u8>>,
    pub warnings: Vec<String>,
}

/// Durable note storage on a single repository.
#[derive(Debug, Clone)]
pub struct GitNoteStore {
    repo_path: PathBuf,
    prefix: String,
    timeout: Duration,
}

impl GitNoteStore {
    /// Open a store rooted at `repo`.
    ///
    /// Canonicalizes the path and verifies it is inside a git work tree.
    pub async fn open(
        repo: impl AsRef<Path>,
        prefix: &str,
        timeout: Duration,
    ) -> StorageResult<Self> {
        validate_prefix(prefix)?;
        let repo_path = repo
            .as_ref()
            .canonicalize()
            .map_err(|_| StorageError::NotAGitRepo(repo.as_ref().display().to_string()))?;

        let store = Self {
            repo_path,
            prefix: prefix.to_string(),
            timeout,
        };

        let out = store.run(&["rev-parse", "--is-inside-work-tree"], None).await;
        match out {
            Ok(stdout) if stdout.trim() == "true" => Ok(store),
            _ => Err(StorageError::NotAGitRepo(
                store.repo_path.display().to_string(),
            )),
        }
    }

    /// Absolute canonical path of the repository.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The fully qualified notes ref for a namespace.
    pub fn notes_ref(&self, namespace: Namespace) -> String {
        format!("refs/notes/{}/{}", self.prefix, namespace)
    }

    /// Resolve a caller-supplied commit reference to a full sha.
    ///
    /// Accepts only `HEAD` or a 4-64 character hex sha; anything else —
    /// branch names, `@{...}` suffixes, path-ish refs — is rejected before
    /// git ever sees it.
    pub async fn resolve_commit(&self, refname: &str) -> StorageResult<String> {
        let candidate = if refname == "HEAD" {
            "HEAD".to_string()
        } else {
            validate_sha(refname)?
        };
        let spec = format!("{candidate}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", &spec], None).await?;
        Ok(out.trim().to_string())
    }

    /// Append a block to the note for `(commit_sha, namespace)`.
    ///
    /// Reads the current note, joins with the block separator, and writes
    /// the whole note back. Idempotent at the text level: callers appending
    /// the same block twice get two blocks, never a corrupted note.
    pub async fn append(
        &self,
        commit_sha: &str,
        block_text: &str,
        namespace: Namespace,
    ) -> StorageResult<()> {
        let sha = validate_sha(commit_sha)?;
        let existing = self.read(&sha, namespace).await?.unwrap_or_default();
        let combined = codec::join_blocks(&existing, block_text);
        let notes_ref = self.notes_ref(namespace);
        self.run_with_stdin(
            &["notes", "--ref", &notes_ref, "add", "-f", "-F", "-", &sha],
            combined.into_bytes(),
        )
        .await?;
        debug!(commit = %sha, namespace = %namespace, "appended note block");
        Ok(())
    }

    /// Read the note text for `(commit_sha, namespace)`, if present.
    pub async fn read(
        &self,
        commit_sha: &str,
        namespace: Namespace,
    ) -> StorageResult<Option<String>> {
        let sha = validate_sha(commit_sha)?;
        let notes_ref = self.notes_ref(namespace);
        match self
            .run(&["notes", "--ref", &notes_ref, "show", &sha], None)
            .await
        {
            Ok(stdout) => Ok(Some(stdout)),
            Err(StorageError::Exec { stderr, .. })
                if stderr.contains("no note found") || stderr.contains("No note found") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// List `(commit_sha, note_blob_sha)` pairs for a namespace.
    pub async fn list(&self, namespace: Namespace) -> StorageResult<Vec<(String, String)>> {
        let notes_ref = self.notes_ref(namespace);
        let out = match self.run(&["notes", "--ref", &notes_ref, "list"], None).await {
            Ok(stdout) => stdout,
            // A namespace that has never been written has no ref yet.
            Err(StorageError::Exec { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        // `git notes list` prints "<note blob sha> <annotated commit sha>".
        let mut pairs = Vec::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(blob), Some(commit)) = (parts.next(), parts.next()) {
                pairs.push((commit.to_string(), blob.to_string()));
            }
        }
        Ok(pairs)
    }

    /// Remove the note for `(commit_sha, namespace)`. Missing notes are not
    /// an error.
    pub async fn remove(&self, commit_sha: &str, namespace: Namespace) -> StorageResult<()> {
        let sha = validate_sha(commit_sha)?;
        let notes_ref = self.notes_ref(namespace);
        self.run(
            &[
                "notes",
                "--ref",
                &notes_ref,
                "remove",
                "--ignore-missing",
                &sha,
            ],
            None,
        )
        .await?;
        Ok(())
    }

    /// Commit metadata: author, timestamp, subject, and changed paths.
    pub async fn commit_info(&self, commit_sha: &str) -> StorageResult<CommitInfo> {
        let sha = validate_sha(commit_sha)?;
        let out = self
            .run(
                &["show", "-s", "--format=%H%x00%an%x00%aI%x00%s", &sha],
                None,
            )
            .await?;
        let mut fields = out.trim_end().split('\0');
        let (full_sha, author, when, subject) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => {
                return Err(StorageError::Exec {
                    command: "show".into(),
                    stderr: format!("unexpected commit format for {sha}"),
                })
            }
        };
        let timestamp = codec::parse_timestamp_flexible(when).ok_or_else(|| {
            StorageError::Exec {
                command: "show".into(),
                stderr: format!("unparseable author date '{when}'"),
            }
        })?;

        let paths_out = self
            .run(
                &[
                    "diff-tree",
                    "--no-commit-id",
                    "--name-only",
                    "-r",
                    "--root",
                    &sha,
                ],
                None,
            )
            .await?;
        let changed_paths = paths_out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(CommitInfo {
            sha: full_sha.to_string(),
            author: author.to_string(),
            timestamp,
            subject: subject.to_string(),
            changed_paths,
        })
    }

    /// Read a single file snapshot at a commit, subject to a size cap.
    pub async fn file_at(
        &self,
        commit_sha: &str,
        path: &str,
        max_bytes: usize,
    ) -> StorageResult<Option<Vec<u8>>> {
        let limits = FileReadLimits {
            max_files: 1,
            max_file_bytes: max_bytes,
            max_total_bytes: max_bytes,
        };
        let mut batch = self
            .batch_file_at(commit_sha, &[path.to_string()], &limits)
            .await?;
        Ok(batch.files.remove(path))
    }

    /// Read several file snapshots through one `git cat-file --batch`
    /// subprocess, bounding file count and bytes.
    pub async fn batch_file_at(
        &self,
        commit_sha: &str,
        paths: &[String],
        limits: &FileReadLimits,
    ) -> StorageResult<FileBatch> {
        let sha = validate_sha(commit_sha)?;
        let mut batch = FileBatch::default();
        if paths.is_empty() {
            return Ok(batch);
        }

        let mut selected = Vec::new();
        for path in paths {
            if selected.len() >= limits.max_files {
                batch
                    .warnings
                    .push(format!("file cap reached, skipped {}", path));
                continue;
            }
            match validate_rel_path(path) {
                Ok(()) => selected.push(path.clone()),
                Err(e) => batch.warnings.push(e.to_string()),
            }
        }
        if selected.is_empty() {
            return Ok(batch);
        }

        let fut = self.cat_file_batch(&sha, &selected, limits, &mut batch);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StorageError::Timeout {
                    command: "cat-file --batch".into(),
                    seconds: self.timeout.as_secs(),
                })
            }
        }
        Ok(batch)
    }

    async fn cat_file_batch(
        &self,
        sha: &str,
        paths: &[String],
        limits: &FileReadLimits,
        batch: &mut FileBatch,
    ) -> StorageResult<()> {
        let mut child = Command::new("git")
            .arg("cat-file")
            .arg("--batch")
            .current_dir(&self.repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout);

        let mut requests = String::new();
        for path in paths {
            requests.push_str(&format!("{sha}:{path}\n"));
        }
        stdin.write_all(requests.as_bytes()).await?;
        drop(stdin);

        let mut total_bytes = 0usize;
        for path in paths {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                batch
                    .warnings
                    .push(format!("object stream ended before {path}"));
                break;
            }
            let header = header.trim_end();
            if header.ends_with("missing") {
                batch.warnings.push(format!("{path}: not in commit"));
                continue;
            }
            let size: usize = header
                .rsplit(' ')
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StorageError::Exec {
                    command: "cat-file --batch".into(),
                    stderr: format!("unexpected header '{header}'"),
                })?;

            // Content plus the trailing newline the batch protocol appends.
            let mut content = vec![0u8; size + 1];
            reader.read_exact(&mut content).await?;
            content.truncate(size);

            if size > limits.max_file_bytes {
                batch
                    .warnings
                    .push(format!("{path}: {size} bytes exceeds per-file cap"));
                continue;
            }
            if total_bytes + size > limits.max_total_bytes {
                batch
                    .warnings
                    .push(format!("{path}: skipped, batch byte budget exhausted"));
                continue;
            }
            total_bytes += size;
            batch.files.insert(path.clone(), content);
        }

        let _ = child.wait().await;
        Ok(())
    }

    /// Configure fetch/push refspecs so notes travel with code.
    ///
    /// No-op when the repository has no `origin` remote.
    pub async fn ensure_sync_config(&self) -> StorageResult<()> {
        let has_origin = self
            .run(&["remote", "get-url", "origin"], None)
            .await
            .is_ok();
        if !has_origin {
            debug!("no origin remote; skipping notes refspec config");
            return Ok(());
        }

        let refspec = format!(
            "+refs/notes/{prefix}/*:refs/notes/{prefix}/*",
            prefix = self.prefix
        );
        for key in ["remote.origin.fetch", "remote.origin.push"] {
            let current = self
                .run(&["config", "--get-all", key], None)
                .await
                .unwrap_or_default();
            if current.lines().any(|l| l.trim() == refspec) {
                continue;
            }
            self.run(&["config", "--add", key, &refspec], None).await?;
            debug!(key, refspec = %refspec, "added notes refspec");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subprocess plumbing
    // ─────────────────────────────────────────────────────────────────────

    async fn run(&self, args: &[&str], stdin: Option<Vec<u8>>) -> StorageResult<String> {
        self.exec(args, stdin).await
    }

    async fn run_with_stdin(&self, args: &[&str], stdin: Vec<u8>) -> StorageResult<String> {
        self.exec(args, Some(stdin)).await
    }

    async fn exec(&self, args: &[&str], stdin: Option<Vec<u8>>) -> StorageResult<String> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.repo_path)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let Some(bytes) = stdin {
            let mut handle = child.stdin.take().expect("piped stdin");
            handle.write_all(&bytes).await?;
            drop(handle);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(command = ?args, timeout = ?self.timeout, "git invocation timed out");
                return Err(StorageError::Timeout {
                    command: args.join(" "),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(StorageError::Exec {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Validate and normalize a commit sha: 4-64 hex characters, lowercased.
pub fn validate_sha(sha: &str) -> StorageResult<String> {
    let normalized = sha.to_ascii_lowercase();
    if normalized.len() < 4
        || normalized.len() > 64
        || !normalized.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(StorageError::RefInvalid {
            value: sha.to_string(),
            reason: "commit sha must be 4-64 hex characters".into(),
        });
    }
    Ok(normalized)
}

/// Validate a user-supplied repository-relative path.
///
/// Rejects NUL bytes, absolute paths, `..` traversal, and the `@`/`:`
/// characters git revision syntax assigns meaning to.
pub fn validate_rel_path(path: &str) -> StorageResult<()> {
    let reject = |reason: &str| {
        Err(StorageError::RefInvalid {
            value: path.to_string(),
            reason: reason.into(),
        })
    };
    if path.is_empty() {
        return reject("path is empty");
    }
    if path.contains('\0') {
        return reject("path contains NUL");
    }
    if path.starts_with('/') {
        return reject("path must be relative");
    }
    if path.contains('@') || path.contains(':') {
        return reject("path contains revision syntax characters");
    }
    if path.split('/').any(|component| component == "..") {
        return reject("path traverses upward");
    }
    Ok(())
}

fn validate_prefix(prefix: &str) -> StorageResult<()> {
    let ok = !prefix.is_empty()
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'/')
        && !prefix.split('/').any(|c| c.is_empty() || c == "..");
    if ok {
        Ok(())
    } else {
        Err(StorageError::RefInvalid {
            value: prefix.to_string(),
            reason: "notes prefix must be alphanumeric path segments".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha_validation() {
        assert_eq!(validate_sha("abc1234").unwrap(), "abc1234");
        assert_eq!(validate_sha("ABC1234").unwrap(), "abc1234");
        assert!(validate_sha("abc").is_err());
        assert!(validate_sha("").is_err());
        assert!(validate_sha("abc123g").is_err());
        assert!(validate_sha("HEAD").is_err());
        assert!(validate_sha("main@{upstream}").is_err());
        assert!(validate_sha(&"a".repeat(65)).is_err());
        assert_eq!(validate_sha(&"a".repeat(64)).unwrap(), "a".repeat(64));
    }

    #[test]
    fn rel_path_validation() {
        assert!(validate_rel_path("src/main.rs").is_ok());
        assert!(validate_rel_path("README.md").is_ok());
        assert!(validate_rel_path("dir with space/file").is_ok());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("../secrets").is_err());
        assert!(validate_rel_path("src/../../etc").is_err());
        assert!(validate_rel_path("file\0name").is_err());
        assert!(validate_rel_path("ref@{0}").is_err());
        assert!(validate_rel_path("sha:path").is_err());
        // A dot component that is not traversal is fine.
        assert!(validate_rel_path("./file").is_ok());
    }

    #[test]
    fn prefix_validation() {
        assert!(validate_prefix("mem").is_ok());
        assert!(validate_prefix("team-mem").is_ok());
        assert!(validate_prefix("a/b").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("a//b").is_err());
        assert!(validate_prefix("a/../b").is_err());
        assert!(validate_prefix("bad space").is_err());
    }
}
