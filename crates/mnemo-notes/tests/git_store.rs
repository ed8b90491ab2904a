//! Integration tests for GitNoteStore against real throwaway repositories.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use mnemo_notes::{codec, GitNoteStore, NoteMeta, StorageError};
use mnemo_types::Namespace;

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(repo)
        .env("GIT_AUTHOR_NAME", "Test Author")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test Author")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed");
}

/// Create a repository with one commit touching `src/main.rs` and `README.md`.
fn test_repo() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path();
    git(repo, &["init", "--quiet"]);
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src/main.rs"), "fn main() {}\n").unwrap();
    std::fs::write(repo.join("README.md"), "# test\n").unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "--quiet", "-m", "initial commit"]);
    tmp
}

async fn open_store(repo: &Path) -> GitNoteStore {
    GitNoteStore::open(repo, "mem", Duration::from_secs(30))
        .await
        .unwrap()
}

fn block(summary: &str, body: &str) -> String {
    codec::encode(
        &NoteMeta::new(Namespace::Decisions, summary, mnemo_types::now()),
        body,
    )
}

#[tokio::test]
async fn open_rejects_non_repo() {
    let tmp = TempDir::new().unwrap();
    let err = GitNoteStore::open(tmp.path(), "mem", Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotAGitRepo(_)));
}

#[tokio::test]
async fn append_then_read_round_trips() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    store
        .append(&sha, &block("Use PostgreSQL", "## Context\nbecause"), Namespace::Decisions)
        .await
        .unwrap();

    let note = store.read(&sha, Namespace::Decisions).await.unwrap().unwrap();
    let blocks = codec::decode(&note).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].meta.summary, "Use PostgreSQL");
    assert!(blocks[0].body.contains("## Context"));
}

#[tokio::test]
async fn second_append_preserves_order() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    store
        .append(&sha, &block("Use PostgreSQL", "a"), Namespace::Decisions)
        .await
        .unwrap();
    store
        .append(&sha, &block("Add index", "b"), Namespace::Decisions)
        .await
        .unwrap();

    let note = store.read(&sha, Namespace::Decisions).await.unwrap().unwrap();
    let blocks = codec::decode(&note).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].meta.summary, "Use PostgreSQL");
    assert_eq!(blocks[1].meta.summary, "Add index");
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    store
        .append(&sha, &block("A decision", ""), Namespace::Decisions)
        .await
        .unwrap();

    assert!(store.read(&sha, Namespace::Blockers).await.unwrap().is_none());
    assert!(store.read(&sha, Namespace::Decisions).await.unwrap().is_some());
}

#[tokio::test]
async fn list_returns_annotated_commits() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    assert!(store.list(Namespace::Decisions).await.unwrap().is_empty());

    store
        .append(&sha, &block("A decision", ""), Namespace::Decisions)
        .await
        .unwrap();

    let listed = store.list(Namespace::Decisions).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, sha);
    assert!(!listed[0].1.is_empty());
}

#[tokio::test]
async fn remove_deletes_note() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    // Removing a note that never existed is fine.
    store.remove(&sha, Namespace::Decisions).await.unwrap();

    store
        .append(&sha, &block("A decision", ""), Namespace::Decisions)
        .await
        .unwrap();
    store.remove(&sha, Namespace::Decisions).await.unwrap();
    assert!(store.read(&sha, Namespace::Decisions).await.unwrap().is_none());
}

#[tokio::test]
async fn commit_info_reports_metadata() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    let info = store.commit_info(&sha).await.unwrap();
    assert_eq!(info.sha, sha);
    assert_eq!(info.author, "Test Author");
    assert_eq!(info.subject, "initial commit");
    assert!(info.changed_paths.contains(&"src/main.rs".to_string()));
    assert!(info.changed_paths.contains(&"README.md".to_string()));
}

#[tokio::test]
async fn file_at_reads_snapshot() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    let bytes = store
        .file_at(&sha, "src/main.rs", 102_400)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, b"fn main() {}\n");

    assert!(store
        .file_at(&sha, "no/such/file.rs", 102_400)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn batch_file_at_applies_caps() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    let limits = mnemo_notes::FileReadLimits {
        max_files: 1,
        max_file_bytes: 102_400,
        max_total_bytes: 102_400,
    };
    let paths = vec!["src/main.rs".to_string(), "README.md".to_string()];
    let batch = store.batch_file_at(&sha, &paths, &limits).await.unwrap();
    assert_eq!(batch.files.len(), 1);
    assert!(!batch.warnings.is_empty());

    // Per-file byte cap skips the blob but keeps going.
    let tiny = mnemo_notes::FileReadLimits {
        max_files: 10,
        max_file_bytes: 4,
        max_total_bytes: 102_400,
    };
    let batch = store.batch_file_at(&sha, &paths, &tiny).await.unwrap();
    assert!(batch.files.is_empty());
    assert_eq!(batch.warnings.len(), 2);
}

#[tokio::test]
async fn batch_file_at_rejects_bad_paths() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    let sha = store.resolve_commit("HEAD").await.unwrap();

    let paths = vec![
        "../escape".to_string(),
        "/abs/path".to_string(),
        "rev@{0}".to_string(),
        "src/main.rs".to_string(),
    ];
    let batch = store
        .batch_file_at(&sha, &paths, &mnemo_notes::FileReadLimits::default())
        .await
        .unwrap();
    assert_eq!(batch.files.len(), 1);
    assert!(batch.files.contains_key("src/main.rs"));
    assert_eq!(batch.warnings.len(), 3);
}

#[tokio::test]
async fn resolve_commit_rejects_ref_syntax() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;

    for bad in ["main", "HEAD~1", "main@{upstream}", "refs/heads/main", "a:b"] {
        let err = store.resolve_commit(bad).await.unwrap_err();
        assert!(
            matches!(err, StorageError::RefInvalid { .. }),
            "{bad} should be rejected"
        );
    }

    // Short prefixes of a real sha resolve.
    let full = store.resolve_commit("HEAD").await.unwrap();
    let resolved = store.resolve_commit(&full[..8]).await.unwrap();
    assert_eq!(resolved, full);
}

#[tokio::test]
async fn ensure_sync_config_without_origin_is_noop() {
    let tmp = test_repo();
    let store = open_store(tmp.path()).await;
    store.ensure_sync_config().await.unwrap();
}

#[tokio::test]
async fn ensure_sync_config_adds_refspecs_once() {
    let tmp = test_repo();
    git(
        tmp.path(),
        &["remote", "add", "origin", "https://example.com/repo.git"],
    );
    let store = open_store(tmp.path()).await;
    store.ensure_sync_config().await.unwrap();
    store.ensure_sync_config().await.unwrap();

    let out = Command::new("git")
        .args(["config", "--get-all", "remote.origin.fetch"])
        .current_dir(tmp.path())
        .output()
        .unwrap();
    let fetch = String::from_utf8_lossy(&out.stdout);
    let occurrences = fetch
        .lines()
        .filter(|l| l.trim() == "+refs/notes/mem/*:refs/notes/mem/*")
        .count();
    assert_eq!(occurrences, 1);
}
