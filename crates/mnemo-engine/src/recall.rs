//! Recall pipeline: vector search with graceful fallback, re-ranking, a
//! small TTL'd LRU cache, and staged hydration from git.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;
use tracing::{debug, warn};

use mnemo_config::Config;
use mnemo_index::{IndexStore, SearchFilters, SharedEmbedder};
use mnemo_notes::{codec, FileReadLimits, GitNoteStore};
use mnemo_types::{
    HydratedMemory, HydrationLevel, Memory, MemoryId, MemoryResult, Namespace,
};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle;

// Re-rank weights: deltas subtracted from a copy of the raw distance.
const RECENCY_WEIGHT: f32 = 0.05;
const NAMESPACE_WEIGHT: f32 = 0.03;
const TAG_WEIGHT: f32 = 0.02;
const MAX_TAG_BONUS_MATCHES: usize = 3;

/// How strongly a namespace is favored in re-ranking.
fn namespace_priority(namespace: Namespace) -> f32 {
    match namespace {
        Namespace::Blockers => 1.0,
        Namespace::Decisions => 0.8,
        Namespace::Learnings => 0.6,
        Namespace::Patterns => 0.5,
        _ => 0.3,
    }
}

struct CacheEntry {
    at: Instant,
    results: Vec<MemoryResult>,
}

/// Query-side engine over the index and git stores.
pub struct RecallEngine {
    git: Arc<GitNoteStore>,
    index: Arc<IndexStore>,
    embedder: SharedEmbedder,
    config: Config,
    cache: Mutex<LruCache<u64, CacheEntry>>,
}

impl RecallEngine {
    pub fn new(
        git: Arc<GitNoteStore>,
        index: Arc<IndexStore>,
        embedder: SharedEmbedder,
        config: Config,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.recall_cache_entries.max(1)).expect("nonzero capacity");
        Self {
            git,
            index,
            embedder,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Scope filters to this engine's repository unless the caller already
    /// chose one.
    fn scoped(&self, mut filters: SearchFilters) -> SearchFilters {
        if filters.repo_path.is_none() {
            filters.repo_path = Some(self.git.repo_path().to_path_buf());
        }
        filters
    }

    /// Semantic search with scalar filters.
    ///
    /// Embeds the query and runs filtered KNN; if the embedder fails the
    /// query degrades to full-text search over summaries and bodies.
    /// Results are re-ranked with additive recency/namespace/tag deltas and
    /// cached briefly.
    pub async fn search(
        &self,
        query: &str,
        filters: SearchFilters,
        limit: usize,
    ) -> EngineResult<Vec<MemoryResult>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let filters = self.scoped(filters);

        let key = cache_key(query, &filters, limit);
        if let Some(hit) = self.cache_get(key) {
            debug!(query, "recall cache hit");
            return Ok(hit);
        }

        let mut results = match self.embedder.embed(query).await {
            Ok(embedding) => self.index.knn(&embedding, limit, &filters)?,
            Err(e) => {
                warn!(error = %e, "query embedding failed, falling back to text search");
                self.index.text_search(query, limit, &filters)?
            }
        };

        rerank(&mut results, query);
        for result in &mut results {
            result.memory.content = lifecycle::decompress_body(&result.memory.content);
        }

        self.cache_put(key, &results);
        Ok(results)
    }

    /// Plain full-text search, no vectors involved.
    pub fn search_text(
        &self,
        query: &str,
        filters: SearchFilters,
        limit: usize,
    ) -> EngineResult<Vec<MemoryResult>> {
        let filters = self.scoped(filters);
        let mut results = self.index.text_search(query, limit, &filters)?;
        for result in &mut results {
            result.memory.content = lifecycle::decompress_body(&result.memory.content);
        }
        Ok(results)
    }

    /// Fetch one memory with its body made readable.
    pub fn get(&self, id: &MemoryId) -> EngineResult<Option<Memory>> {
        Ok(self.index.get(id)?.map(|mut memory| {
            memory.content = lifecycle::decompress_body(&memory.content);
            memory
        }))
    }

    /// Fetch several memories, preserving order.
    pub fn get_batch(&self, ids: &[MemoryId]) -> EngineResult<Vec<Memory>> {
        let mut memories = self.index.get_batch(ids)?;
        for memory in &mut memories {
            memory.content = lifecycle::decompress_body(&memory.content);
        }
        Ok(memories)
    }

    /// Hydrate a memory to the requested level.
    ///
    /// `Summary` is metadata only; `Full` adds the body read back from the
    /// git note; `Files` adds commit-time snapshots of changed files under
    /// the configured caps. Missing git objects become warnings, never
    /// errors: the caller gets the best level available.
    pub async fn hydrate(
        &self,
        memory: Memory,
        level: HydrationLevel,
    ) -> EngineResult<HydratedMemory> {
        let mut hydrated = HydratedMemory::summary(memory);
        if level == HydrationLevel::Summary {
            return Ok(hydrated);
        }

        let id = hydrated.memory.id.clone();
        match self
            .git
            .read(&hydrated.memory.commit_sha, hydrated.memory.namespace)
            .await
        {
            Ok(Some(note)) => {
                let blocks = codec::decode_lenient(&note);
                match blocks.into_iter().nth(id.ordinal as usize) {
                    Some(block) => hydrated.full_body = Some(block.body),
                    None => hydrated
                        .warnings
                        .push(format!("note block {} missing from git", id.ordinal)),
                }
            }
            Ok(None) => hydrated
                .warnings
                .push("note missing from git".to_string()),
            Err(e) => hydrated.warnings.push(format!("note unreadable: {e}")),
        }
        let _ = self.index.touch(&id);

        if level == HydrationLevel::Full {
            return Ok(hydrated);
        }

        // FILES: snapshots of the commit's changed paths, capped.
        match self.git.commit_info(&hydrated.memory.commit_sha).await {
            Ok(info) => {
                let paths: Vec<String> = info
                    .changed_paths
                    .into_iter()
                    .take(self.config.max_hydration_files)
                    .collect();
                let limits = FileReadLimits {
                    max_files: self.config.max_hydration_files,
                    max_file_bytes: self.config.max_file_bytes,
                    max_total_bytes: self
                        .config
                        .max_file_bytes
                        .saturating_mul(self.config.max_hydration_files),
                };
                match self
                    .git
                    .batch_file_at(&hydrated.memory.commit_sha, &paths, &limits)
                    .await
                {
                    Ok(batch) => {
                        hydrated.files = batch.files;
                        hydrated.warnings.extend(batch.warnings);
                    }
                    Err(e) => hydrated.warnings.push(format!("file snapshots failed: {e}")),
                }
            }
            Err(e) => hydrated
                .warnings
                .push(format!("commit info unavailable: {e}")),
        }

        Ok(hydrated)
    }

    /// All memories for a spec, grouped by namespace.
    pub fn context(&self, spec: &str) -> EngineResult<BTreeMap<Namespace, Vec<Memory>>> {
        let filters = self.scoped(SearchFilters {
            spec: Some(spec.to_string()),
            ..SearchFilters::default()
        });
        let memories = self.index.list_filtered(&filters, 500)?;
        let mut grouped: BTreeMap<Namespace, Vec<Memory>> = BTreeMap::new();
        for mut memory in memories {
            memory.content = lifecycle::decompress_body(&memory.content);
            grouped.entry(memory.namespace).or_default().push(memory);
        }
        Ok(grouped)
    }

    /// Most recent memories in this repository.
    pub fn recent(
        &self,
        limit: usize,
        namespace: Option<Namespace>,
    ) -> EngineResult<Vec<Memory>> {
        let mut memories =
            self.index
                .list_recent(Some(self.git.repo_path()), namespace, limit)?;
        for memory in &mut memories {
            memory.content = lifecycle::decompress_body(&memory.content);
        }
        Ok(memories)
    }

    /// Memories similar to an existing one.
    pub async fn similar(&self, id: &MemoryId, k: usize) -> EngineResult<Vec<MemoryResult>> {
        let memory = self
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let text = format!("{}\n\n{}", memory.summary, memory.content);
        let filters = self.scoped(SearchFilters::default());

        let results = match self.embedder.embed(&text).await {
            Ok(embedding) => self.index.knn(&embedding, k + 1, &filters)?,
            Err(e) => {
                warn!(error = %e, "similar() embedding failed, using text search");
                self.index.text_search(&memory.summary, k + 1, &filters)?
            }
        };

        let mut out: Vec<MemoryResult> = results
            .into_iter()
            .filter(|r| &r.memory.id != id)
            .collect();
        out.truncate(k);
        for result in &mut out {
            result.memory.content = lifecycle::decompress_body(&result.memory.content);
        }
        Ok(out)
    }

    /// Every memory attached to a commit.
    pub fn by_commit(&self, commit_sha: &str) -> EngineResult<Vec<Memory>> {
        let sha = mnemo_notes::validate_sha(commit_sha)?;
        let mut memories = self.index.list_by_commit(self.git.repo_path(), &sha)?;
        for memory in &mut memories {
            memory.content = lifecycle::decompress_body(&memory.content);
        }
        Ok(memories)
    }

    fn cache_get(&self, key: u64) -> Option<Vec<MemoryResult>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(&key) {
            Some(entry) if entry.at.elapsed() <= self.config.recall_cache_ttl() => {
                Some(entry.results.clone())
            }
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: u64, results: &[MemoryResult]) {
        let mut cache = self.cache.lock().unwrap();
        cache.put(
            key,
            CacheEntry {
                at: Instant::now(),
                results: results.to_vec(),
            },
        );
    }
}

fn cache_key(query: &str, filters: &SearchFilters, limit: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    filters.cache_key().hash(&mut hasher);
    limit.hash(&mut hasher);
    hasher.finish()
}

/// Re-rank results by subtracting recency, namespace, and tag deltas from
/// a copy of the distance; the reported distance stays raw.
fn rerank(results: &mut [MemoryResult], query: &str) {
    let now = mnemo_types::now();
    let query_terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();

    let adjusted = |result: &MemoryResult| -> f32 {
        let recency =
            lifecycle::decay(result.memory.timestamp, 30.0, now) as f32 * RECENCY_WEIGHT;
        let namespace = namespace_priority(result.memory.namespace) * NAMESPACE_WEIGHT;
        let tag_matches = result
            .memory
            .tags
            .iter()
            .filter(|tag| query_terms.contains(&tag.to_lowercase()))
            .take(MAX_TAG_BONUS_MATCHES)
            .count();
        let tags = tag_matches as f32 * TAG_WEIGHT;
        result.distance - recency - namespace - tags
    };

    results.sort_by(|a, b| adjusted(a).total_cmp(&adjusted(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ns: Namespace, ordinal: u32, distance: f32, tags: &[&str]) -> MemoryResult {
        MemoryResult {
            memory: Memory {
                id: MemoryId::new(ns, "abc1234", ordinal),
                commit_sha: "abc1234".into(),
                repo_path: "/tmp/repo".into(),
                namespace: ns,
                summary: "s".into(),
                content: "c".into(),
                timestamp: mnemo_types::now(),
                spec: None,
                phase: None,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                status: Default::default(),
                relates_to: vec![],
            },
            distance,
        }
    }

    #[test]
    fn rerank_prefers_blockers_at_equal_distance() {
        let mut results = vec![
            result(Namespace::Research, 0, 0.5, &[]),
            result(Namespace::Blockers, 1, 0.5, &[]),
        ];
        rerank(&mut results, "anything");
        assert_eq!(results[0].memory.namespace, Namespace::Blockers);
        // Raw distances are untouched.
        assert_eq!(results[0].distance, 0.5);
    }

    #[test]
    fn rerank_boosts_tag_matches() {
        let mut results = vec![
            result(Namespace::Research, 0, 0.5, &[]),
            result(Namespace::Research, 1, 0.5, &["database"]),
        ];
        rerank(&mut results, "database tuning");
        assert_eq!(results[0].memory.id.ordinal, 1);
    }

    #[test]
    fn rerank_keeps_clear_winners() {
        let mut results = vec![
            result(Namespace::Blockers, 0, 0.9, &[]),
            result(Namespace::Research, 1, 0.1, &[]),
        ];
        rerank(&mut results, "q");
        assert_eq!(results[0].memory.id.ordinal, 1);
    }

    #[test]
    fn cache_key_varies_with_inputs() {
        let filters = SearchFilters::default();
        let a = cache_key("q", &filters, 5);
        assert_eq!(a, cache_key("q", &filters, 5));
        assert_ne!(a, cache_key("q2", &filters, 5));
        assert_ne!(a, cache_key("q", &filters, 6));
        let ns_filters = SearchFilters {
            namespace: Some(Namespace::Decisions),
            ..Default::default()
        };
        assert_ne!(a, cache_key("q", &ns_filters, 5));
    }
}
