//! Reconciliation between git notes and the index.
//!
//! Git is authoritative. Sync re-derives index rows from note text and
//! never writes to git. Incremental runs track the last-seen note blob per
//! `(commit, namespace)` and only re-decode notes whose blob moved;
//! repair hints force specific notes through regardless.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use mnemo_config::Config;
use mnemo_index::{IndexStore, SharedEmbedder};
use mnemo_notes::{codec, GitNoteStore};
use mnemo_types::{Memory, MemoryId, MemoryStatus, Namespace};

use crate::error::EngineResult;
use crate::hints;
use crate::lifecycle;

/// Counts from a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Notes examined.
    pub scanned: usize,
    /// Memories inserted for the first time.
    pub added: usize,
    /// Memories re-written from changed notes.
    pub updated: usize,
    /// Index rows removed because their block or note disappeared.
    pub removed: usize,
    /// Vector rows written.
    pub embedded: usize,
    /// Blocks whose embedding failed (indexed without vectors).
    pub embed_failures: usize,
}

/// Per-namespace symmetric difference between git and the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct NamespaceDiff {
    pub in_git_not_index: usize,
    pub in_index_not_git: usize,
    pub hash_mismatch: usize,
}

impl NamespaceDiff {
    pub fn is_clean(&self) -> bool {
        self.in_git_not_index == 0 && self.in_index_not_git == 0 && self.hash_mismatch == 0
    }
}

/// Full consistency report.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsistencyReport {
    pub by_namespace: BTreeMap<String, NamespaceDiff>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.by_namespace.values().all(NamespaceDiff::is_clean)
    }
}

/// Counts from a repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub upserts: usize,
    pub deletes: usize,
}

/// Bridges the git note store and the index.
pub struct SyncEngine {
    git: Arc<GitNoteStore>,
    index: Arc<IndexStore>,
    embedder: SharedEmbedder,
    config: Config,
}

impl SyncEngine {
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

    /// Incrementally reconcile changed notes into the index.
    ///
    /// Re-running converges: a second run over unchanged notes is a no-op.
    pub async fn incremental(&self) -> EngineResult<SyncStats> {
        let repo = self.git.repo_path().to_path_buf();
        let mut stats = SyncStats::default();

        // Repair hints force their notes through the blob-sha check.
        let forced: HashSet<(String, String)> =
            hints::take_for_repo(&self.config.layout().repair_hints_dir(), &repo)
                .into_iter()
                .map(|h| (h.commit_sha, h.namespace))
                .collect();

        for namespace in Namespace::ALL {
            let listed = self.git.list(namespace).await?;
            let in_git: HashMap<String, String> = listed.iter().cloned().collect();

            for (commit, blob) in &listed {
                stats.scanned += 1;
                let known = self.index.note_state(&repo, commit, namespace.as_str())?;
                let force =
                    forced.contains(&(commit.clone(), namespace.as_str().to_string()));
                if !force && known.as_deref() == Some(blob.as_str()) {
                    continue;
                }
                self.sync_note(commit, namespace, blob, known.is_some(), &mut stats)
                    .await?;
            }

            // Notes we tracked that no longer exist in git.
            for (commit, _) in self.index.note_states(&repo, namespace.as_str())? {
                if in_git.contains_key(&commit) {
                    continue;
                }
                for id in self.index.ids_for_note(&repo, &commit, namespace)? {
                    if self.index.delete(&id)? {
                        stats.removed += 1;
                    }
                }
                self.index
                    .clear_note_state(&repo, &commit, namespace.as_str())?;
            }
        }

        info!(?stats, "incremental sync complete");
        Ok(stats)
    }

    /// Re-decode one note and reconcile all of its blocks.
    async fn sync_note(
        &self,
        commit: &str,
        namespace: Namespace,
        blob: &str,
        known_before: bool,
        stats: &mut SyncStats,
    ) -> EngineResult<()> {
        let repo = self.git.repo_path().to_path_buf();

        let Some(note) = self.git.read(commit, namespace).await? else {
            for id in self.index.ids_for_note(&repo, commit, namespace)? {
                if self.index.delete(&id)? {
                    stats.removed += 1;
                }
            }
            self.index.clear_note_state(&repo, commit, namespace.as_str())?;
            return Ok(());
        };

        let blocks = codec::decode_lenient(&note);
        let block_count = blocks.len();

        // Best-effort batch embedding for the whole note.
        let texts: Vec<String> = blocks
            .iter()
            .map(|b| format!("{}\n\n{}", b.meta.summary, b.body))
            .collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let embeddings: Vec<Option<Vec<f32>>> = match self.embedder.embed_batch(&text_refs).await
        {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(e) => {
                warn!(commit, namespace = %namespace, error = %e, "sync embedding failed");
                stats.embed_failures += block_count;
                vec![None; block_count]
            }
        };

        for (ordinal, (block, embedding)) in blocks.into_iter().zip(embeddings).enumerate() {
            let id = MemoryId::new(namespace, commit.to_string(), ordinal as u32);
            let existing = self.index.get(&id)?;

            // Lifecycle state lives only in the index; a re-decode must not
            // resurrect or decompress what the lifecycle engine did.
            let (status, content) = match &existing {
                Some(row) if row.status == MemoryStatus::Tombstone => {
                    (MemoryStatus::Tombstone, String::new())
                }
                Some(row) if row.status == MemoryStatus::Archived => {
                    (MemoryStatus::Archived, lifecycle::compress_body(&block.body))
                }
                Some(row) => (row.status, block.body.clone()),
                None => (block.meta.status, block.body.clone()),
            };

            let memory = Memory {
                id: id.clone(),
                commit_sha: commit.to_string(),
                repo_path: repo.clone(),
                namespace,
                summary: block.meta.summary,
                content,
                timestamp: block.meta.timestamp,
                spec: block.meta.spec,
                phase: block.meta.phase,
                tags: block.meta.tags,
                status,
                relates_to: block.meta.relates_to,
            };

            let embedded = embedding.is_some();
            self.index.upsert(&memory, embedding.as_deref())?;
            if embedded {
                stats.embedded += 1;
            }
            if existing.is_some() {
                stats.updated += 1;
            } else {
                stats.added += 1;
            }
        }

        // Blocks that disappeared from the note lose their rows.
        for id in self.index.ids_for_note(&repo, commit, namespace)? {
            if id.ordinal as usize >= block_count && self.index.delete(&id)? {
                stats.removed += 1;
            }
        }

        self.index
            .set_note_state(&repo, commit, namespace.as_str(), blob)?;
        debug!(commit, namespace = %namespace, blocks = block_count, known_before, "note synced");
        Ok(())
    }

    /// Rebuild the index from scratch: truncate derived tables, reset the
    /// vector table to the embedder's dimension, rescan everything.
    ///
    /// Interruption-safe by convergence: a killed rebuild leaves a valid
    /// database that the next run (incremental or full) completes.
    pub async fn full_reindex(&self) -> EngineResult<SyncStats> {
        info!("starting full reindex");
        self.index.truncate_derived()?;
        self.index
            .reset_vectors(self.embedder.dimensions(), self.embedder.name())?;
        self.incremental().await
    }

    /// Symmetric-difference report between git notes and index rows.
    pub async fn verify_consistency(&self) -> EngineResult<ConsistencyReport> {
        let repo = self.git.repo_path().to_path_buf();
        let mut report = ConsistencyReport::default();

        for namespace in Namespace::ALL {
            let mut diff = NamespaceDiff::default();
            let mut git_ids: HashSet<String> = HashSet::new();

            for (commit, _blob) in self.git.list(namespace).await? {
                let Some(note) = self.git.read(&commit, namespace).await? else {
                    continue;
                };
                for (ordinal, block) in codec::decode_lenient(&note).into_iter().enumerate() {
                    let id = MemoryId::new(namespace, commit.clone(), ordinal as u32);
                    git_ids.insert(id.to_string());
                    match self.index.get(&id)? {
                        None => diff.in_git_not_index += 1,
                        Some(row) => {
                            if !row_matches_block(&row, &block) {
                                diff.hash_mismatch += 1;
                            }
                        }
                    }
                }
            }

            let filters = mnemo_index::SearchFilters {
                repo_path: Some(repo.clone()),
                namespace: Some(namespace),
                ..Default::default()
            };
            for memory in self.index.list_filtered(&filters, 1_000_000)? {
                if !git_ids.contains(&memory.id.to_string()) {
                    diff.in_index_not_git += 1;
                }
            }

            report
                .by_namespace
                .insert(namespace.as_str().to_string(), diff);
        }

        Ok(report)
    }

    /// Drive the consistency diff to zero with minimal writes.
    ///
    /// Missing or mismatched rows are re-derived from git; index rows with
    /// no git counterpart are deleted. Git itself is never written.
    /// Idempotent: a second pass finds nothing to do.
    pub async fn verify_and_repair(&self) -> EngineResult<RepairStats> {
        let repo = self.git.repo_path().to_path_buf();
        let mut stats = RepairStats::default();
        let mut sync_stats = SyncStats::default();

        for namespace in Namespace::ALL {
            let listed = self.git.list(namespace).await?;
            let in_git: HashMap<String, String> = listed.iter().cloned().collect();
            let mut commits_to_fix: HashSet<String> = HashSet::new();

            for (commit, _blob) in &listed {
                let Some(note) = self.git.read(commit, namespace).await? else {
                    continue;
                };
                let blocks = codec::decode_lenient(&note);
                let block_count = blocks.len();
                for (ordinal, block) in blocks.into_iter().enumerate() {
                    let id = MemoryId::new(namespace, commit.clone(), ordinal as u32);
                    match self.index.get(&id)? {
                        None => {
                            commits_to_fix.insert(commit.clone());
                        }
                        Some(row) if !row_matches_block(&row, &block) => {
                            commits_to_fix.insert(commit.clone());
                        }
                        Some(_) => {}
                    }
                }
                for id in self.index.ids_for_note(&repo, commit, namespace)? {
                    if id.ordinal as usize >= block_count {
                        if self.index.delete(&id)? {
                            stats.deletes += 1;
                        }
                    }
                }
            }

            for commit in &commits_to_fix {
                let blob = in_git.get(commit).cloned().unwrap_or_default();
                let before = sync_stats.added + sync_stats.updated;
                self.sync_note(commit, namespace, &blob, true, &mut sync_stats)
                    .await?;
                stats.upserts += (sync_stats.added + sync_stats.updated) - before;
            }

            // Index rows whose note is gone from git entirely.
            let filters = mnemo_index::SearchFilters {
                repo_path: Some(repo.clone()),
                namespace: Some(namespace),
                ..Default::default()
            };
            for memory in self.index.list_filtered(&filters, 1_000_000)? {
                if in_git.contains_key(&memory.commit_sha) {
                    continue;
                }
                if self.index.delete(&memory.id)? {
                    stats.deletes += 1;
                }
            }
            for (commit, _) in self.index.note_states(&repo, namespace.as_str())? {
                if !in_git.contains_key(&commit) {
                    self.index
                        .clear_note_state(&repo, &commit, namespace.as_str())?;
                }
            }
        }

        info!(?stats, "verify_and_repair complete");
        Ok(stats)
    }
}

/// Whether an index row still reflects a git block, honoring
/// lifecycle-owned state (archived compression, tombstone body clearing,
/// index-side status transitions).
fn row_matches_block(row: &Memory, block: &codec::Block) -> bool {
    if row.summary != block.meta.summary {
        return false;
    }
    match row.status {
        MemoryStatus::Tombstone => true,
        MemoryStatus::Archived => lifecycle::decompress_body(&row.content) == block.body,
        _ => row.content == block.body,
    }
}
