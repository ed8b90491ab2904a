//! Capture pipeline.
//!
//! The contract: at most one concurrent capture per repository, a
//! successfully appended note is never lost, and nothing is indexed that
//! was not first appended to git. Embedding and indexing failures after
//! the git append are soft; a repair hint lets sync reconcile later.

use std::sync::Arc;

use tracing::{debug, info, warn};

use mnemo_config::Config;
use mnemo_index::{IndexStore, MemoryPatch, SharedEmbedder};
use mnemo_notes::{codec, GitNoteStore, NoteLimits, NoteMeta};
use mnemo_types::{Memory, MemoryId, MemoryStatus, Namespace, Pattern};

use crate::error::{EngineError, EngineResult};
use crate::hints::{self, RepairHint};
use crate::lock::CaptureLock;

/// A capture request. `commit` defaults to `HEAD`.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub summary: String,
    pub body: String,
    pub spec: Option<String>,
    pub phase: Option<String>,
    pub tags: Vec<String>,
    pub commit: Option<String>,
    pub relates_to: Vec<MemoryId>,
    pub status: Option<MemoryStatus>,
}

impl CaptureRequest {
    pub fn new(summary: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Non-fatal degradations a capture can report alongside success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureWarning {
    /// The embedder failed; the memory is indexed without a vector.
    EmbeddingFailed,
    /// The index write failed; git holds the note and sync will index it.
    IndexedLater,
}

impl CaptureWarning {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureWarning::EmbeddingFailed => "embedding_failed",
            CaptureWarning::IndexedLater => "indexed_later",
        }
    }
}

/// Outcome of a successful capture.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub id: MemoryId,
    /// Whether the index row was written. Git holds the note either way.
    pub indexed: bool,
    pub warning: Option<CaptureWarning>,
}

/// Orchestrates validate → lock → append → embed → index.
pub struct CaptureEngine {
    git: Arc<GitNoteStore>,
    index: Arc<IndexStore>,
    embedder: SharedEmbedder,
    config: Config,
}

impl CaptureEngine {
    pub fn new(
        git: Arc<GitNoteStore>,
        index: Arc<IndexStore>,
        embedder: SharedEmbedder,
        config: Config,
    ) -> Self {
        Self {
            git,
            index,
            embedder,
            config,
        }
    }

    fn limits(&self) -> NoteLimits {
        NoteLimits {
            max_summary_chars: self.config.max_summary_chars,
            max_content_bytes: self.config.max_content_bytes,
        }
    }

    /// Capture a memory into a namespace.
    ///
    /// Validation happens before any side effect; failures after the git
    /// append degrade rather than abort, so a caller seeing `Ok` can rely
    /// on the note existing in git.
    pub async fn capture(
        &self,
        namespace: Namespace,
        request: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        // 1. Validate. No side effects on failure.
        // Second precision: the note header stores whole seconds, and the
        // index row must parse back equal to it.
        let timestamp = {
            use chrono::Timelike;
            let now = mnemo_types::now();
            now.with_nanosecond(0).unwrap_or(now)
        };
        let meta = NoteMeta {
            namespace,
            timestamp,
            summary: request.summary.clone(),
            spec: request.spec.clone(),
            phase: request.phase.clone(),
            tags: codec::dedup_tags(request.tags.clone()),
            status: request.status.unwrap_or_default(),
            relates_to: request.relates_to.clone(),
        };
        codec::validate(&meta, &request.body, &self.limits())?;

        // 2. Exclusive per-repo lock, bounded wait.
        let lock_path = self.config.layout().capture_lock(self.git.repo_path());
        let _lock = CaptureLock::acquire(&lock_path, self.config.capture_lock_timeout()).await?;

        // 3. Resolve the target commit; sanitization rejects ref syntax.
        let commit_ref = request.commit.as_deref().unwrap_or("HEAD");
        let sha = self.git.resolve_commit(commit_ref).await?;

        // 4. Next ordinal = count of parseable blocks already on the note.
        let existing = self.git.read(&sha, namespace).await?.unwrap_or_default();
        let ordinal = codec::count_blocks(&existing) as u32;

        // 5. Append to git. Failure here aborts with no index mutation.
        let block = codec::encode(&meta, &request.body);
        self.git.append(&sha, &block, namespace).await?;

        // 6. The memory as the index will see it.
        let id = MemoryId::new(namespace, sha.clone(), ordinal);
        let memory = Memory {
            id: id.clone(),
            commit_sha: sha.clone(),
            repo_path: self.git.repo_path().to_path_buf(),
            namespace,
            summary: meta.summary.clone(),
            content: request.body.trim_end().to_string(),
            timestamp: meta.timestamp,
            spec: meta.spec.clone(),
            phase: meta.phase.clone(),
            tags: meta.tags.clone(),
            status: meta.status,
            relates_to: meta.relates_to.clone(),
        };

        // 7. Best-effort embedding.
        let mut warning = None;
        let text = format!("{}\n\n{}", memory.summary, memory.content);
        let embedding = match self.embedder.embed(&text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(id = %id, error = %e, "embedding failed, capturing without vector");
                warning = Some(CaptureWarning::EmbeddingFailed);
                None
            }
        };

        // 8. Index upsert; on failure leave a breadcrumb for sync. An
        // embedding failure leaves one too: the note blob won't change
        // again, so without a hint incremental sync would never revisit it
        // to fill the vector in.
        if warning == Some(CaptureWarning::EmbeddingFailed) {
            hints::write(
                &self.config.layout().repair_hints_dir(),
                &RepairHint {
                    repo_path: memory.repo_path.clone(),
                    commit_sha: sha.clone(),
                    namespace: namespace.as_str().to_string(),
                    id: id.to_string(),
                },
            );
        }
        let indexed = match self.index.upsert(&memory, embedding.as_deref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %id, error = %e, "index upsert failed, writing repair hint");
                hints::write(
                    &self.config.layout().repair_hints_dir(),
                    &RepairHint {
                        repo_path: memory.repo_path.clone(),
                        commit_sha: sha.clone(),
                        namespace: namespace.as_str().to_string(),
                        id: id.to_string(),
                    },
                );
                warning = Some(CaptureWarning::IndexedLater);
                false
            }
        };

        info!(id = %id, indexed, "captured memory");
        // 9. The lock guard releases on every path out of this scope.
        Ok(CaptureResult {
            id,
            indexed,
            warning,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Namespaced convenience captures
    // ─────────────────────────────────────────────────────────────────────

    /// Capture a decision with Context/Rationale(/Impact) sections.
    pub async fn capture_decision(
        &self,
        summary: impl Into<String>,
        context: &str,
        rationale: &str,
        impact: Option<&str>,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let mut sections = vec![("Context", context), ("Rationale", rationale)];
        if let Some(impact) = impact {
            sections.push(("Impact", impact));
        }
        let request = CaptureRequest {
            summary: summary.into(),
            body: compose_sections(&sections),
            ..extra
        };
        self.capture(Namespace::Decisions, request).await
    }

    /// Capture an open blocker.
    pub async fn capture_blocker(
        &self,
        summary: impl Into<String>,
        description: &str,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let request = CaptureRequest {
            summary: summary.into(),
            body: compose_sections(&[("Blocker", description)]),
            status: Some(MemoryStatus::Active),
            ..extra
        };
        self.capture(Namespace::Blockers, request).await
    }

    /// Resolve an existing blocker: flips its index row to `resolved` and
    /// appends a resolution block to the same note that relates back to it.
    pub async fn resolve_blocker(
        &self,
        blocker_id: &MemoryId,
        resolution: &str,
    ) -> EngineResult<CaptureResult> {
        let blocker = self
            .index
            .get(blocker_id)?
            .ok_or_else(|| EngineError::NotFound(format!("blocker {blocker_id}")))?;
        if blocker.namespace != Namespace::Blockers {
            return Err(EngineError::NotFound(format!(
                "{blocker_id} is not a blocker"
            )));
        }

        let request = CaptureRequest {
            summary: truncate_summary(
                &format!("Resolved: {}", blocker.summary),
                self.config.max_summary_chars,
            ),
            body: compose_sections(&[("Resolution", resolution)]),
            spec: blocker.spec.clone(),
            commit: Some(blocker.commit_sha.clone()),
            relates_to: vec![blocker_id.clone()],
            status: Some(MemoryStatus::Resolved),
            ..CaptureRequest::default()
        };
        let result = self.capture(Namespace::Blockers, request).await?;

        self.index
            .update(blocker_id, &MemoryPatch::status(MemoryStatus::Resolved))?;
        debug!(blocker = %blocker_id, resolution = %result.id, "blocker resolved");
        Ok(result)
    }

    /// Capture a learning.
    pub async fn capture_learning(
        &self,
        summary: impl Into<String>,
        details: &str,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let request = CaptureRequest {
            summary: summary.into(),
            body: compose_sections(&[("Learning", details)]),
            ..extra
        };
        self.capture(Namespace::Learnings, request).await
    }

    /// Capture a progress note.
    pub async fn capture_progress(
        &self,
        summary: impl Into<String>,
        details: &str,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let request = CaptureRequest {
            summary: summary.into(),
            body: details.to_string(),
            ..extra
        };
        self.capture(Namespace::Progress, request).await
    }

    /// Capture a retrospective with what-went-well / what-needs-work.
    pub async fn capture_retrospective(
        &self,
        summary: impl Into<String>,
        went_well: &str,
        needs_improvement: &str,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let request = CaptureRequest {
            summary: summary.into(),
            body: compose_sections(&[
                ("What went well", went_well),
                ("What needs improvement", needs_improvement),
            ]),
            ..extra
        };
        self.capture(Namespace::Retrospective, request).await
    }

    /// Capture a review note.
    pub async fn capture_review(
        &self,
        summary: impl Into<String>,
        findings: &str,
        extra: CaptureRequest,
    ) -> EngineResult<CaptureResult> {
        let request = CaptureRequest {
            summary: summary.into(),
            body: compose_sections(&[("Findings", findings)]),
            ..extra
        };
        self.capture(Namespace::Reviews, request).await
    }

    /// Persist a detected pattern as a memory in the `patterns` namespace.
    ///
    /// The pattern's machine fields ride in tags so they survive the trip
    /// through the note header.
    pub async fn capture_pattern(&self, pattern: &Pattern) -> EngineResult<CaptureResult> {
        let mut body_lines = vec![format!(
            "Detected across {} memories (confidence {:.2}).",
            pattern.occurrence_count(),
            pattern.confidence
        )];
        if !pattern.evidence.is_empty() {
            body_lines.push(String::new());
            body_lines.push("## Evidence".to_string());
            body_lines.push(String::new());
            for id in &pattern.evidence {
                body_lines.push(format!("- {id}"));
            }
        }

        let mut tags = vec![
            format!("pattern-type:{}", pattern.pattern_type),
            format!("pattern-status:{}", pattern.status),
            format!("confidence:{:.2}", pattern.confidence),
        ];
        tags.extend(pattern.terms.iter().cloned());

        let request = CaptureRequest {
            summary: truncate_summary(
                &format!("Pattern: {}", pattern.name),
                self.config.max_summary_chars,
            ),
            body: body_lines.join("\n"),
            tags,
            relates_to: pattern.evidence.clone(),
            ..CaptureRequest::default()
        };
        self.capture(Namespace::Patterns, request).await
    }
}

/// Render titled markdown sections.
fn compose_sections(sections: &[(&str, &str)]) -> String {
    sections
        .iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .map(|(title, content)| format!("## {title}\n\n{}", content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Clip a summary to the configured character budget on a char boundary.
fn truncate_summary(summary: &str, max_chars: usize) -> String {
    if summary.chars().count() <= max_chars {
        summary.to_string()
    } else {
        summary.chars().take(max_chars).collect()
    }
}
