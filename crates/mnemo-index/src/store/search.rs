//! KNN and full-text search with scalar filters.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::ToSql;
use tracing::debug;

use mnemo_types::{Memory, MemoryResult, MemoryStatus, Namespace, Timestamp};

use crate::error::IndexResult;
use crate::{fts, vector};

use super::memory_ops::{row_to_memory, MEMORY_COLUMNS};
use super::{path_str, IndexStore};

/// KNN over-fetch multiplier. The vector table cannot evaluate scalar
/// predicates in the same pass, so we fetch more hits than requested and
/// filter afterwards.
const OVERFETCH: usize = 3;

/// Scalar predicates shared by vector and text search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub repo_path: Option<PathBuf>,
    pub namespace: Option<Namespace>,
    pub spec: Option<String>,
    pub status: Option<MemoryStatus>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    /// Match memories carrying at least one of these tags.
    pub tags_any: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        *self == SearchFilters::default()
    }

    /// Stable textual form, used as part of recall cache keys.
    pub fn cache_key(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}",
            self.repo_path, self.namespace, self.spec, self.status, self.since, self.until,
            self.tags_any
        )
    }

    /// Render as SQL conjuncts appended to an existing WHERE clause.
    fn push_sql(&self, sql: &mut String, args: &mut Vec<Box<dyn ToSql>>) {
        if let Some(repo) = &self.repo_path {
            args.push(Box::new(path_str(repo)));
            sql.push_str(&format!(" AND m.repo_path = ?{}", args.len()));
        }
        if let Some(ns) = self.namespace {
            args.push(Box::new(ns.as_str().to_string()));
            sql.push_str(&format!(" AND m.namespace = ?{}", args.len()));
        }
        if let Some(spec) = &self.spec {
            args.push(Box::new(spec.clone()));
            sql.push_str(&format!(" AND m.spec = ?{}", args.len()));
        }
        if let Some(status) = self.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND m.status = ?{}", args.len()));
        }
        if let Some(since) = &self.since {
            args.push(Box::new(since.to_rfc3339()));
            sql.push_str(&format!(" AND m.timestamp >= ?{}", args.len()));
        }
        if let Some(until) = &self.until {
            args.push(Box::new(until.to_rfc3339()));
            sql.push_str(&format!(" AND m.timestamp <= ?{}", args.len()));
        }
        if !self.tags_any.is_empty() {
            let placeholders: Vec<String> = self
                .tags_any
                .iter()
                .map(|tag| {
                    args.push(Box::new(tag.clone()));
                    format!("?{}", args.len())
                })
                .collect();
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(m.tags_json) \
                 WHERE json_each.value IN ({}))",
                placeholders.join(", ")
            ));
        }
    }
}

impl IndexStore {
    /// K-nearest-neighbor search with scalar filters.
    ///
    /// Over-fetches from the vector table, applies the filters against the
    /// scalar rows, and truncates to `k`, ascending by distance.
    pub fn knn(
        &self,
        embedding: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> IndexResult<Vec<MemoryResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();

        let fetch = (k * OVERFETCH).max(30);
        let hits = vector::knn(&conn, embedding, fetch)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let distances: HashMap<String, f32> = hits
            .iter()
            .map(|h| (h.id.clone(), h.distance))
            .collect();

        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        let id_placeholders: Vec<String> = hits
            .iter()
            .map(|h| {
                args.push(Box::new(h.id.clone()));
                format!("?{}", args.len())
            })
            .collect();
        let mut sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id IN ({})",
            id_placeholders.join(", ")
        );
        filters.push_sql(&mut sql, &mut args);

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(refs.as_slice())?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let memory = row_to_memory(row)?;
            let distance = distances
                .get(&memory.id.to_string())
                .copied()
                .unwrap_or(f32::MAX);
            results.push(MemoryResult { memory, distance });
        }
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(k);
        debug!(k, returned = results.len(), "knn search");
        Ok(results)
    }

    /// Ranked full-text search over summary and body with the same filter
    /// surface as [`IndexStore::knn`].
    ///
    /// The returned distance is derived from the BM25 rank and normalized
    /// into `(0, 1]`, lower meaning a better match.
    pub fn text_search(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> IndexResult<Vec<MemoryResult>> {
        let sanitized = fts::sanitize_query(query);
        if sanitized.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();

        // Qualify every column: both sides of the join carry `id`.
        let qualified = MEMORY_COLUMNS
            .split(", ")
            .map(|c| format!("m.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(sanitized)];
        let mut sql = format!(
            "SELECT {qualified}, bm25(memories_fts) AS rank
             FROM memories_fts f
             JOIN memories m ON m.id = f.id
             WHERE memories_fts MATCH ?1"
        );
        filters.push_sql(&mut sql, &mut args);
        args.push(Box::new(k as i64));
        sql.push_str(&format!(" ORDER BY rank LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(refs.as_slice())?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let memory = row_to_memory(row)?;
            let rank: f64 = row.get(12)?;
            results.push(MemoryResult {
                memory,
                distance: (1.0 / (1.0 + rank.abs())) as f32,
            });
        }
        Ok(results)
    }

    /// Scalar-only listing with the shared filter surface, newest first.
    pub fn list_filtered(
        &self,
        filters: &SearchFilters,
        limit: usize,
    ) -> IndexResult<Vec<Memory>> {
        let conn = self.conn.lock().unwrap();

        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE 1=1");
        filters.push_sql(&mut sql, &mut args);
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY m.timestamp DESC LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_memory(row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_types::MemoryId;

    fn sample(ns: Namespace, ordinal: u32, summary: &str, tags: &[&str]) -> Memory {
        Memory {
            id: MemoryId::new(ns, "abc1234", ordinal),
            commit_sha: "abc1234".into(),
            repo_path: "/tmp/repo".into(),
            namespace: ns,
            summary: summary.into(),
            content: format!("Body about {summary}"),
            timestamp: mnemo_types::now(),
            spec: Some("proj".into()),
            phase: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            status: MemoryStatus::Active,
            relates_to: vec![],
        }
    }

    fn store_with_vectors() -> IndexStore {
        let store = IndexStore::open_in_memory().unwrap();
        store.init_vectors(4, "mock").unwrap();
        store
    }

    #[test]
    fn knn_orders_by_distance() {
        let store = store_with_vectors();
        let a = sample(Namespace::Decisions, 0, "about cats", &[]);
        let b = sample(Namespace::Decisions, 1, "about dogs", &[]);
        let c = sample(Namespace::Decisions, 2, "about birds", &[]);
        store.upsert(&a, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(&b, Some(&[0.0, 1.0, 0.0, 0.0])).unwrap();
        store.upsert(&c, Some(&[0.0, 0.0, 1.0, 0.0])).unwrap();

        let results = store
            .knn(&[0.9, 0.1, 0.0, 0.0], 10, &SearchFilters::default())
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].memory.id, a.id);
        assert!(results[0].distance <= results[1].distance);
        assert!(results[1].distance <= results[2].distance);
        assert!(results[0].distance >= 0.0);
    }

    #[test]
    fn knn_truncates_to_k() {
        let store = store_with_vectors();
        for i in 0..10 {
            let m = sample(Namespace::Research, i, &format!("memory {i}"), &[]);
            let x = i as f32 / 10.0;
            store.upsert(&m, Some(&[x, 1.0 - x, 0.0, 0.0])).unwrap();
        }
        let results = store
            .knn(&[0.5, 0.5, 0.0, 0.0], 3, &SearchFilters::default())
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn knn_applies_namespace_filter() {
        let store = store_with_vectors();
        let a = sample(Namespace::Decisions, 0, "decision", &[]);
        let b = sample(Namespace::Learnings, 0, "learning", &[]);
        store.upsert(&a, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(&b, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();

        let filters = SearchFilters {
            namespace: Some(Namespace::Learnings),
            ..Default::default()
        };
        let results = store.knn(&[1.0, 0.0, 0.0, 0.0], 10, &filters).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.namespace, Namespace::Learnings);
    }

    #[test]
    fn knn_applies_tag_and_time_filters() {
        let store = store_with_vectors();
        let mut tagged = sample(Namespace::Decisions, 0, "tagged", &["database", "perf"]);
        let untagged = sample(Namespace::Decisions, 1, "untagged", &[]);
        let mut old = sample(Namespace::Decisions, 2, "old tagged", &["database"]);
        old.timestamp = mnemo_types::now() - chrono::Duration::days(30);
        tagged.timestamp = mnemo_types::now();
        store.upsert(&tagged, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(&untagged, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(&old, Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();

        let filters = SearchFilters {
            tags_any: vec!["database".into()],
            ..Default::default()
        };
        let results = store.knn(&[1.0, 0.0, 0.0, 0.0], 10, &filters).unwrap();
        assert_eq!(results.len(), 2);

        let filters = SearchFilters {
            tags_any: vec!["database".into()],
            since: Some(mnemo_types::now() - chrono::Duration::days(7)),
            ..Default::default()
        };
        let results = store.knn(&[1.0, 0.0, 0.0, 0.0], 10, &filters).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.summary, "tagged");
    }

    #[test]
    fn text_search_finds_body_terms() {
        let store = IndexStore::open_in_memory().unwrap();
        let mut m = sample(Namespace::Decisions, 0, "Use PostgreSQL", &[]);
        m.content = "We evaluated postgres against sqlite for the data layer".into();
        store.upsert(&m, None).unwrap();
        store
            .upsert(&sample(Namespace::Decisions, 1, "Unrelated", &[]), None)
            .unwrap();

        let results = store
            .text_search("postgres", 5, &SearchFilters::default())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.summary, "Use PostgreSQL");
        assert!(results[0].distance > 0.0 && results[0].distance <= 1.0);
    }

    #[test]
    fn text_search_is_safe_against_operators() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .upsert(&sample(Namespace::Decisions, 0, "plain", &[]), None)
            .unwrap();
        // Raw FTS5 syntax must not error out.
        for query in ["a AND b", "col:val", "\"unclosed", "NEAR(x y)", "x*"] {
            store
                .text_search(query, 5, &SearchFilters::default())
                .unwrap();
        }
    }

    #[test]
    fn list_filtered_respects_status() {
        let store = IndexStore::open_in_memory().unwrap();
        let mut resolved = sample(Namespace::Blockers, 0, "resolved one", &[]);
        resolved.status = MemoryStatus::Resolved;
        store.upsert(&resolved, None).unwrap();
        store
            .upsert(&sample(Namespace::Blockers, 1, "active one", &[]), None)
            .unwrap();

        let filters = SearchFilters {
            status: Some(MemoryStatus::Active),
            ..Default::default()
        };
        let active = store.list_filtered(&filters, 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].summary, "active one");
    }

    #[test]
    fn knn_without_vector_rows_is_empty() {
        let store = store_with_vectors();
        store
            .upsert(&sample(Namespace::Decisions, 0, "no vector", &[]), None)
            .unwrap();
        let results = store
            .knn(&[1.0, 0.0, 0.0, 0.0], 5, &SearchFilters::default())
            .unwrap();
        assert!(results.is_empty());
    }
}
