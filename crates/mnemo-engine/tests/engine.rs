//! End-to-end engine tests against real throwaway git repositories and a
//! file-backed index.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mnemo_config::Config;
use mnemo_engine::{CaptureRequest, CaptureWarning, EngineError, Engines};
use mnemo_index::{FailingEmbedder, MockEmbedder, SearchFilters};
use mnemo_notes::codec;
use mnemo_types::{HydrationLevel, MemoryStatus, Namespace};

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

struct Harness {
    _repo_dir: TempDir,
    _data_dir: TempDir,
    engines: Arc<Engines>,
    config: Config,
}

async fn harness_with(embedder: mnemo_index::SharedEmbedder) -> Harness {
    let repo_dir = TempDir::new().unwrap();
    let repo = repo_dir.path();
    git(repo, &["init", "--quiet"]);
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src/main.rs"), "fn main() {}\n").unwrap();
    std::fs::write(repo.join("README.md"), "# test\n").unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "--quiet", "-m", "initial commit"]);

    let data_dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: Some(data_dir.path().to_path_buf()),
        ..Config::default()
    };

    let engines = Engines::open(repo, config.clone(), embedder).await.unwrap();
    Harness {
        _repo_dir: repo_dir,
        _data_dir: data_dir,
        engines: Arc::new(engines),
        config,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MockEmbedder::new(64))).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn capture_decision_lands_in_git_and_index() {
    let h = harness().await;
    let result = h
        .engines
        .capture
        .capture_decision(
            "Use PostgreSQL",
            "We needed a database for the persistence layer.",
            "Strong JSON support and team familiarity.",
            None,
            CaptureRequest::default(),
        )
        .await
        .unwrap();

    assert!(result.indexed);
    assert!(result.warning.is_none());
    assert_eq!(result.id.namespace, Namespace::Decisions);
    assert_eq!(result.id.ordinal, 0);

    // Git holds exactly one block that matches the inputs.
    let note = h
        .engines
        .git
        .read(&result.id.commit_sha, Namespace::Decisions)
        .await
        .unwrap()
        .unwrap();
    let blocks = codec::decode(&note).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].meta.summary, "Use PostgreSQL");
    assert!(blocks[0].body.contains("## Context"));
    assert!(blocks[0].body.contains("## Rationale"));

    // Index row is present with defaults.
    let memory = h.engines.index.get(&result.id).unwrap().unwrap();
    assert_eq!(memory.status, MemoryStatus::Active);
    assert!(memory.tags.is_empty());
}

#[tokio::test]
async fn second_capture_gets_next_ordinal() {
    let h = harness().await;
    let first = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("Use PostgreSQL", "a"))
        .await
        .unwrap();
    let second = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("Add index", "b"))
        .await
        .unwrap();

    assert_eq!(first.id.ordinal, 0);
    assert_eq!(second.id.ordinal, 1);
    assert_eq!(first.id.commit_sha, second.id.commit_sha);

    let note = h
        .engines
        .git
        .read(&first.id.commit_sha, Namespace::Decisions)
        .await
        .unwrap()
        .unwrap();
    let blocks = codec::decode(&note).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].meta.summary, "Use PostgreSQL");
    assert_eq!(blocks[1].meta.summary, "Add index");
}

#[tokio::test]
async fn capture_then_search_finds_it() {
    let h = harness().await;
    let result = h
        .engines
        .capture
        .capture(
            Namespace::Decisions,
            CaptureRequest::new("Use PostgreSQL", "postgres database selection rationale"),
        )
        .await
        .unwrap();
    assert!(result.indexed);

    let hits = h
        .engines
        .recall
        .search(
            "Use PostgreSQL\n\npostgres database selection rationale",
            SearchFilters {
                namespace: Some(Namespace::Decisions),
                ..Default::default()
            },
            5,
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].memory.id, result.id);
    assert!(hits[0].distance >= 0.0);
}

#[tokio::test]
async fn oversized_body_is_rejected_without_side_effects() {
    let h = harness().await;
    let big = "x".repeat(200 * 1024);
    let err = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("big", big))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.exit_code(), 2);

    // No git note, no index rows.
    let sha = h.engines.git.resolve_commit("HEAD").await.unwrap();
    assert!(h
        .engines
        .git
        .read(&sha, Namespace::Decisions)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.engines.index.stats(None).unwrap().total, 0);
}

#[tokio::test]
async fn oversized_summary_is_rejected() {
    let h = harness().await;
    let err = h
        .engines
        .capture
        .capture(
            Namespace::Decisions,
            CaptureRequest::new("s".repeat(101), "body"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn capture_rejects_ref_syntax_commits() {
    let h = harness().await;
    for bad in ["main@{upstream}", "HEAD~1", "refs/heads/main"] {
        let request = CaptureRequest {
            commit: Some(bad.to_string()),
            ..CaptureRequest::new("summary", "body")
        };
        let err = h
            .engines
            .capture
            .capture(Namespace::Decisions, request)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)), "{bad}");
        assert_eq!(err.exit_code(), 3);
    }
}

#[tokio::test]
async fn resolve_blocker_flips_status_and_appends_resolution() {
    let h = harness().await;
    let blocker = h
        .engines
        .capture
        .capture_blocker(
            "API rate limited",
            "Third-party API throttles us at 10 rps.",
            CaptureRequest::default(),
        )
        .await
        .unwrap();

    let resolution = h
        .engines
        .capture
        .resolve_blocker(&blocker.id, "rate limit raised")
        .await
        .unwrap();

    // Original row transitioned.
    let original = h.engines.index.get(&blocker.id).unwrap().unwrap();
    assert_eq!(original.status, MemoryStatus::Resolved);

    // Resolution block carries resolved status and relates back.
    let resolved = h.engines.index.get(&resolution.id).unwrap().unwrap();
    assert_eq!(resolved.status, MemoryStatus::Resolved);
    assert_eq!(resolved.relates_to, vec![blocker.id.clone()]);

    // Both blocks live on the same note.
    let note = h
        .engines
        .git
        .read(&blocker.id.commit_sha, Namespace::Blockers)
        .await
        .unwrap()
        .unwrap();
    let blocks = codec::decode(&note).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].meta.status, MemoryStatus::Resolved);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_captures_get_distinct_ordinals() {
    let h = harness().await;
    let engines = h.engines.clone();

    let mut handles = Vec::new();
    for i in 0..4 {
        let engines = engines.clone();
        handles.push(tokio::spawn(async move {
            engines
                .capture
                .capture(
                    Namespace::Progress,
                    CaptureRequest::new(format!("step {i}"), format!("body {i}")),
                )
                .await
        }));
    }

    let mut ordinals: Vec<u32> = Vec::new();
    for handle in handles {
        ordinals.push(handle.await.unwrap().unwrap().id.ordinal);
    }
    ordinals.sort_unstable();
    assert_eq!(ordinals, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn capture_times_out_when_lock_is_held() {
    let repo_dir = TempDir::new().unwrap();
    let repo = repo_dir.path();
    git(repo, &["init", "--quiet"]);
    std::fs::write(repo.join("f"), "x").unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "--quiet", "-m", "c"]);

    let data_dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: Some(data_dir.path().to_path_buf()),
        capture_lock_timeout_ms: 300,
        ..Config::default()
    };
    let engines = Engines::open(repo, config.clone(), Arc::new(MockEmbedder::new(64)))
        .await
        .unwrap();

    let lock_path = config.layout().capture_lock(engines.git.repo_path());
    let _held = mnemo_engine::CaptureLock::acquire(&lock_path, Duration::from_secs(1))
        .await
        .unwrap();

    let err = engines
        .capture
        .capture(Namespace::Progress, CaptureRequest::new("s", "b"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout { .. }));
    assert_eq!(err.exit_code(), 6);
}

// ─────────────────────────────────────────────────────────────────────────────
// Graceful degradation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn capture_survives_embedder_failure_and_sync_heals() {
    let h = harness_with(Arc::new(FailingEmbedder::new(64))).await;

    let result = h
        .engines
        .capture
        .capture(
            Namespace::Learnings,
            CaptureRequest::new("Tests should be fast", "keep the suite under a minute"),
        )
        .await
        .unwrap();

    // Capture succeeded without a vector.
    assert_eq!(result.warning, Some(CaptureWarning::EmbeddingFailed));
    let note = h
        .engines
        .git
        .read(&result.id.commit_sha, Namespace::Learnings)
        .await
        .unwrap();
    assert!(note.is_some());
    let report = h.engines.index.verify().unwrap();
    assert_eq!(report.memories_without_vector, 1);

    // Recall still works through the text fallback.
    let hits = h
        .engines
        .recall
        .search("tests fast", SearchFilters::default(), 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.id, result.id);

    // Embedder recovers: a healthy engine set over the same stores syncs
    // the vector in via the repair hint.
    let healed = Engines::assemble(
        h.engines.git.clone(),
        h.engines.index.clone(),
        Arc::new(MockEmbedder::new(64)),
        h.config.clone(),
    );
    let stats = healed.sync.incremental().await.unwrap();
    assert_eq!(stats.embedded, 1);
    assert_eq!(h.engines.index.verify().unwrap().memories_without_vector, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_band_note_is_reconciled() {
    let h = harness().await;

    // Simulate a capture that died after the git append: write the note
    // directly, bypassing the index.
    let sha = h.engines.git.resolve_commit("HEAD").await.unwrap();
    let block = codec::encode(
        &mnemo_notes::NoteMeta::new(Namespace::Decisions, "Orphaned decision", mnemo_types::now()),
        "body written but never indexed",
    );
    h.engines
        .git
        .append(&sha, &block, Namespace::Decisions)
        .await
        .unwrap();

    let report = h.engines.sync.verify_consistency().await.unwrap();
    assert_eq!(report.by_namespace["decisions"].in_git_not_index, 1);

    let repairs = h.engines.sync.verify_and_repair().await.unwrap();
    assert_eq!(repairs.upserts, 1);

    // The memory is now indexed and the report is clean.
    let report = h.engines.sync.verify_consistency().await.unwrap();
    assert!(report.is_clean());

    // Idempotence: a second repair is a no-op.
    let repairs = h.engines.sync.verify_and_repair().await.unwrap();
    assert_eq!(repairs, mnemo_engine::RepairStats::default());
}

#[tokio::test]
async fn incremental_sync_converges() {
    let h = harness().await;
    for i in 0..3 {
        h.engines
            .capture
            .capture(
                Namespace::Research,
                CaptureRequest::new(format!("finding {i}"), "details"),
            )
            .await
            .unwrap();
    }

    let first = h.engines.sync.incremental().await.unwrap();
    assert_eq!(first.added + first.updated, 3);

    // Nothing changed; the second run touches nothing.
    let second = h.engines.sync.incremental().await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.removed, 0);
}

#[tokio::test]
async fn full_reindex_rebuilds_from_git() {
    let h = harness().await;
    for i in 0..3 {
        h.engines
            .capture
            .capture(
                Namespace::Learnings,
                CaptureRequest::new(format!("learning {i}"), format!("body {i}")),
            )
            .await
            .unwrap();
    }

    // Wreck the index, then rebuild.
    h.engines.index.truncate_derived().unwrap();
    assert_eq!(h.engines.index.stats(None).unwrap().total, 0);

    let stats = h.engines.sync.full_reindex().await.unwrap();
    assert_eq!(stats.added, 3);
    assert_eq!(h.engines.index.stats(None).unwrap().total, 3);

    let report = h.engines.sync.verify_consistency().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn removed_note_prunes_index_rows() {
    let h = harness().await;
    let result = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("doomed", "body"))
        .await
        .unwrap();
    h.engines.sync.incremental().await.unwrap();

    h.engines
        .git
        .remove(&result.id.commit_sha, Namespace::Decisions)
        .await
        .unwrap();

    let stats = h.engines.sync.incremental().await.unwrap();
    assert_eq!(stats.removed, 1);
    assert!(h.engines.index.get(&result.id).unwrap().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Hydration
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hydration_levels_are_staged() {
    let h = harness().await;
    let body = "## Context\n\nthe full body as written";
    let result = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("hydrate me", body))
        .await
        .unwrap();
    let memory = h.engines.index.get(&result.id).unwrap().unwrap();

    let summary = h
        .engines
        .recall
        .hydrate(memory.clone(), HydrationLevel::Summary)
        .await
        .unwrap();
    assert!(summary.full_body.is_none());
    assert!(summary.files.is_empty());

    let full = h
        .engines
        .recall
        .hydrate(memory.clone(), HydrationLevel::Full)
        .await
        .unwrap();
    assert_eq!(full.full_body.as_deref(), Some(body));

    let files = h
        .engines
        .recall
        .hydrate(memory, HydrationLevel::Files)
        .await
        .unwrap();
    assert_eq!(files.full_body.as_deref(), Some(body));
    // Snapshots come only from the commit's changed files.
    let changed = h
        .engines
        .git
        .commit_info(&result.id.commit_sha)
        .await
        .unwrap()
        .changed_paths;
    assert!(!files.files.is_empty());
    for path in files.files.keys() {
        assert!(changed.contains(path));
    }
    assert!(files.files.len() <= h.config.max_hydration_files);
}

#[tokio::test]
async fn hydration_misses_degrade_to_warnings() {
    let h = harness().await;
    let result = h
        .engines
        .capture
        .capture(Namespace::Decisions, CaptureRequest::new("doomed", "body"))
        .await
        .unwrap();
    let memory = h.engines.index.get(&result.id).unwrap().unwrap();

    // Remove the note behind recall's back.
    h.engines
        .git
        .remove(&result.id.commit_sha, Namespace::Decisions)
        .await
        .unwrap();

    let hydrated = h
        .engines
        .recall
        .hydrate(memory, HydrationLevel::Full)
        .await
        .unwrap();
    assert!(hydrated.full_body.is_none());
    assert!(!hydrated.warnings.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Recall surfaces
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn context_groups_by_namespace() {
    let h = harness().await;
    for (ns, summary) in [
        (Namespace::Decisions, "decision one"),
        (Namespace::Learnings, "learning one"),
        (Namespace::Learnings, "learning two"),
    ] {
        let request = CaptureRequest {
            spec: Some("my-project".into()),
            ..CaptureRequest::new(summary, "body")
        };
        h.engines.capture.capture(ns, request).await.unwrap();
    }

    let grouped = h.engines.recall.context("my-project").unwrap();
    assert_eq!(grouped[&Namespace::Decisions].len(), 1);
    assert_eq!(grouped[&Namespace::Learnings].len(), 2);
    assert!(!grouped.contains_key(&Namespace::Blockers));
}

#[tokio::test]
async fn recent_and_by_commit() {
    let h = harness().await;
    let result = h
        .engines
        .capture
        .capture(Namespace::Progress, CaptureRequest::new("did a thing", "b"))
        .await
        .unwrap();

    let recent = h.engines.recall.recent(10, None).unwrap();
    assert_eq!(recent.len(), 1);

    let by_commit = h.engines.recall.by_commit(&result.id.commit_sha).unwrap();
    assert_eq!(by_commit.len(), 1);
    assert_eq!(by_commit[0].id, result.id);
}

#[tokio::test]
async fn similar_excludes_self() {
    let h = harness().await;
    let a = h
        .engines
        .capture
        .capture(
            Namespace::Learnings,
            CaptureRequest::new("retry with backoff", "retry strategy details"),
        )
        .await
        .unwrap();
    h.engines
        .capture
        .capture(
            Namespace::Learnings,
            CaptureRequest::new("retry with backoff again", "retry strategy details"),
        )
        .await
        .unwrap();

    let similar = h.engines.recall.similar(&a.id, 5).await.unwrap();
    assert!(!similar.is_empty());
    assert!(similar.iter().all(|r| r.memory.id != a.id));
}
