//! Row-level memory operations.

use std::path::Path;

use rusqlite::{params, Connection, Row};
use tracing::debug;

use mnemo_types::{Memory, MemoryId, MemoryStatus, Namespace, Timestamp};

use crate::error::{IndexError, IndexResult};
use crate::{fts, vector};

use super::{parse_ts, path_str, IndexStore};

/// Chunk size for batched upserts; intermediate commits bound memory.
const UPSERT_CHUNK: usize = 1_000;

pub(crate) const MEMORY_COLUMNS: &str = "id, commit_sha, namespace, summary, body, tags_json, \
     timestamp, spec, phase, status, relates_to_json, repo_path";

/// Partial update applied by [`IndexStore::update`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub summary: Option<String>,
    pub body: Option<String>,
    pub status: Option<MemoryStatus>,
    pub spec: Option<Option<String>>,
    pub phase: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub relates_to: Option<Vec<MemoryId>>,
}

impl MemoryPatch {
    pub fn status(status: MemoryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

pub(crate) fn row_to_memory(row: &Row<'_>) -> IndexResult<Memory> {
    let id_raw: String = row.get(0)?;
    let namespace_raw: String = row.get(2)?;
    let tags_json: String = row.get(5)?;
    let timestamp_raw: String = row.get(6)?;
    let status_raw: String = row.get(9)?;
    let relates_json: String = row.get(10)?;
    let repo_path: String = row.get(11)?;

    let id = MemoryId::parse(&id_raw)
        .map_err(|e| IndexError::Constraint(format!("bad id in index: {e}")))?;
    let namespace: Namespace = namespace_raw
        .parse()
        .map_err(|e: mnemo_types::UnknownNamespace| IndexError::Constraint(e.to_string()))?;
    let status: MemoryStatus = status_raw
        .parse()
        .map_err(IndexError::Constraint)?;

    Ok(Memory {
        id,
        commit_sha: row.get(1)?,
        repo_path: repo_path.into(),
        namespace,
        summary: row.get(3)?,
        content: row.get(4)?,
        timestamp: parse_ts(&timestamp_raw)?,
        spec: row.get(7)?,
        phase: row.get(8)?,
        tags: serde_json::from_str(&tags_json)?,
        status,
        relates_to: serde_json::from_str::<Vec<String>>(&relates_json)?
            .iter()
            .filter_map(|s| MemoryId::parse(s).ok())
            .collect(),
    })
}

fn write_memory(conn: &Connection, memory: &Memory) -> IndexResult<()> {
    let now = mnemo_types::now().to_rfc3339();
    let tags_json = serde_json::to_string(&memory.tags)?;
    let relates_json = serde_json::to_string(
        &memory
            .relates_to
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>(),
    )?;

    conn.execute(
        "INSERT INTO memories
             (id, commit_sha, namespace, summary, body, tags_json, timestamp,
              spec, phase, status, relates_to_json, repo_path,
              created_at, updated_at, last_accessed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?13)
         ON CONFLICT(id) DO UPDATE SET
             commit_sha = excluded.commit_sha,
             namespace = excluded.namespace,
             summary = excluded.summary,
             body = excluded.body,
             tags_json = excluded.tags_json,
             timestamp = excluded.timestamp,
             spec = excluded.spec,
             phase = excluded.phase,
             status = excluded.status,
             relates_to_json = excluded.relates_to_json,
             repo_path = excluded.repo_path,
             updated_at = excluded.updated_at",
        params![
            memory.id.to_string(),
            memory.commit_sha,
            memory.namespace.as_str(),
            memory.summary,
            memory.content,
            tags_json,
            memory.timestamp.to_rfc3339(),
            memory.spec,
            memory.phase,
            memory.status.as_str(),
            relates_json,
            path_str(&memory.repo_path),
            now,
        ],
    )?;

    fts::upsert(conn, &memory.id.to_string(), &memory.summary, &memory.content)?;
    Ok(())
}

impl IndexStore {
    /// Insert or refresh one memory across all three tables in a single
    /// transaction. Without an embedding the memory is still discoverable
    /// through scalar and text search.
    pub fn upsert(&self, memory: &Memory, embedding: Option<&[f32]>) -> IndexResult<()> {
        if memory.repo_path.as_os_str().is_empty() {
            return Err(IndexError::Constraint(
                "memory.repo_path must be set; the index is partitioned by repository".into(),
            ));
        }
        let dim = match embedding {
            Some(_) => Some(self.expected_dim()?),
            None => None,
        };
        self.with_transaction(|conn| {
            write_memory(conn, memory)?;
            if let Some(vec) = embedding {
                vector::store_embedding(conn, &memory.id.to_string(), vec, dim.unwrap())?;
            }
            Ok(())
        })?;
        debug!(id = %memory.id, embedded = embedding.is_some(), "upserted memory");
        Ok(())
    }

    /// Upsert a batch in chunks with intermediate commits.
    ///
    /// `embeddings`, when present, must be index-aligned with `memories`;
    /// `None` entries skip the vector row for that memory.
    pub fn upsert_batch(
        &self,
        memories: &[Memory],
        embeddings: Option<&[Option<Vec<f32>>]>,
    ) -> IndexResult<usize> {
        if let Some(vecs) = embeddings {
            if vecs.len() != memories.len() {
                return Err(IndexError::Constraint(format!(
                    "embeddings length {} does not match memories length {}",
                    vecs.len(),
                    memories.len()
                )));
            }
        }
        if memories.iter().any(|m| m.repo_path.as_os_str().is_empty()) {
            return Err(IndexError::Constraint(
                "every memory in a batch must carry repo_path".into(),
            ));
        }

        let needs_dim = embeddings
            .map(|vecs| vecs.iter().any(Option::is_some))
            .unwrap_or(false);
        let dim = if needs_dim { Some(self.expected_dim()?) } else { None };

        let mut written = 0;
        for (chunk_idx, chunk) in memories.chunks(UPSERT_CHUNK).enumerate() {
            let offset = chunk_idx * UPSERT_CHUNK;
            self.with_transaction(|conn| {
                for (i, memory) in chunk.iter().enumerate() {
                    write_memory(conn, memory)?;
                    if let Some(vecs) = embeddings {
                        if let Some(vec) = &vecs[offset + i] {
                            vector::store_embedding(
                                conn,
                                &memory.id.to_string(),
                                vec,
                                dim.unwrap(),
                            )?;
                        }
                    }
                }
                Ok(())
            })?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Fetch one memory by id.
    pub fn get(&self, id: &MemoryId) -> IndexResult<Option<Memory>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    /// Fetch several memories, preserving input order; missing ids are
    /// simply absent.
    pub fn get_batch(&self, ids: &[MemoryId]) -> IndexResult<Vec<Memory>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut rows = stmt.query(params![id.to_string()])?;
            if let Some(row) = rows.next()? {
                out.push(row_to_memory(row)?);
            }
        }
        Ok(out)
    }

    /// Apply a partial update. Returns the updated memory, or `None` if the
    /// id is unknown.
    pub fn update(&self, id: &MemoryId, patch: &MemoryPatch) -> IndexResult<Option<Memory>> {
        let Some(mut memory) = self.get(id)? else {
            return Ok(None);
        };

        if let Some(summary) = &patch.summary {
            memory.summary = summary.clone();
        }
        if let Some(body) = &patch.body {
            memory.content = body.clone();
        }
        if let Some(status) = patch.status {
            memory.status = status;
        }
        if let Some(spec) = &patch.spec {
            memory.spec = spec.clone();
        }
        if let Some(phase) = &patch.phase {
            memory.phase = phase.clone();
        }
        if let Some(tags) = &patch.tags {
            memory.tags = tags.clone();
        }
        if let Some(relates) = &patch.relates_to {
            memory.relates_to = relates.clone();
        }

        self.with_transaction(|conn| write_memory(conn, &memory))?;
        Ok(Some(memory))
    }

    /// Delete a memory and its vector/FTS rows. Returns whether it existed.
    pub fn delete(&self, id: &MemoryId) -> IndexResult<bool> {
        let id_str = id.to_string();
        let existed = self.with_transaction(|conn| {
            let rows = conn.execute("DELETE FROM memories WHERE id = ?1", params![id_str])?;
            fts::delete(conn, &id_str)?;
            if conn
                .prepare("SELECT COUNT(*) FROM memory_vectors LIMIT 1")
                .is_ok()
            {
                vector::delete_embedding(conn, &id_str)?;
            }
            Ok(rows > 0)
        })?;
        Ok(existed)
    }

    /// Record an access for lifecycle decay decisions.
    pub fn touch(&self, id: &MemoryId) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET last_accessed = ?1 WHERE id = ?2",
            params![mnemo_types::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    /// Last recorded access time, if any.
    pub fn last_accessed(&self, id: &MemoryId) -> IndexResult<Option<Timestamp>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_accessed FROM memories WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(raw.flatten().and_then(|s| parse_ts(&s).ok()))
    }

    /// Most recent memories, newest first.
    pub fn list_recent(
        &self,
        repo_path: Option<&Path>,
        namespace: Option<Namespace>,
        limit: usize,
    ) -> IndexResult<Vec<Memory>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(repo) = repo_path {
            args.push(Box::new(path_str(repo)));
            sql.push_str(&format!(" AND repo_path = ?{}", args.len()));
        }
        if let Some(ns) = namespace {
            args.push(Box::new(ns.as_str().to_string()));
            sql.push_str(&format!(" AND namespace = ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY timestamp DESC LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_memory(row)?);
        }
        Ok(out)
    }

    /// Every memory attached to a commit in a repository.
    pub fn list_by_commit(&self, repo_path: &Path, commit_sha: &str) -> IndexResult<Vec<Memory>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE repo_path = ?1 AND commit_sha = ?2
             ORDER BY namespace, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![path_str(repo_path), commit_sha])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_memory(row)?);
        }
        Ok(out)
    }

    /// Ids indexed for one `(repo, commit, namespace)` note.
    pub fn ids_for_note(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        namespace: Namespace,
    ) -> IndexResult<Vec<MemoryId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM memories
             WHERE repo_path = ?1 AND commit_sha = ?2 AND namespace = ?3",
        )?;
        let rows = stmt.query_map(
            params![path_str(repo_path), commit_sha, namespace.as_str()],
            |row| row.get::<_, String>(0),
        )?;
        let mut ids = Vec::new();
        for raw in rows {
            if let Ok(id) = MemoryId::parse(&raw?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_types::Namespace;

    fn sample(ns: Namespace, sha: &str, ordinal: u32, summary: &str) -> Memory {
        Memory {
            id: MemoryId::new(ns, sha, ordinal),
            commit_sha: sha.to_string(),
            repo_path: "/tmp/repo".into(),
            namespace: ns,
            summary: summary.to_string(),
            content: format!("body of {summary}"),
            timestamp: mnemo_types::now(),
            spec: Some("proj".into()),
            phase: None,
            tags: vec!["db".into()],
            status: MemoryStatus::Active,
            relates_to: vec![],
        }
    }

    #[test]
    fn upsert_and_get_round_trips() {
        let store = IndexStore::open_in_memory().unwrap();
        let memory = sample(Namespace::Decisions, "abc1234", 0, "Use PostgreSQL");
        store.upsert(&memory, None).unwrap();

        let fetched = store.get(&memory.id).unwrap().unwrap();
        assert_eq!(fetched, memory);
    }

    #[test]
    fn upsert_requires_repo_path() {
        let store = IndexStore::open_in_memory().unwrap();
        let mut memory = sample(Namespace::Decisions, "abc1234", 0, "x");
        memory.repo_path = std::path::PathBuf::new();
        let err = store.upsert(&memory, None).unwrap_err();
        assert!(matches!(err, IndexError::Constraint(_)));
    }

    #[test]
    fn upsert_with_embedding_checks_dimension() {
        let store = IndexStore::open_in_memory().unwrap();
        store.init_vectors(4, "mock").unwrap();
        let memory = sample(Namespace::Decisions, "abc1234", 0, "x");

        store.upsert(&memory, Some(&[0.1, 0.2, 0.3, 0.4])).unwrap();
        let err = store.upsert(&memory, Some(&[0.1, 0.2])).unwrap_err();
        assert!(matches!(err, IndexError::Constraint(_)));
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let store = IndexStore::open_in_memory().unwrap();
        let mut memory = sample(Namespace::Decisions, "abc1234", 0, "first");
        store.upsert(&memory, None).unwrap();
        memory.summary = "second".into();
        store.upsert(&memory, None).unwrap();

        assert_eq!(store.stats(None).unwrap().total, 1);
        assert_eq!(store.get(&memory.id).unwrap().unwrap().summary, "second");
    }

    #[test]
    fn get_batch_preserves_order_and_skips_missing() {
        let store = IndexStore::open_in_memory().unwrap();
        let a = sample(Namespace::Decisions, "abc1234", 0, "a");
        let b = sample(Namespace::Decisions, "abc1234", 1, "b");
        store.upsert(&a, None).unwrap();
        store.upsert(&b, None).unwrap();

        let missing = MemoryId::new(Namespace::Decisions, "abc1234", 9);
        let got = store
            .get_batch(&[b.id.clone(), missing, a.id.clone()])
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, b.id);
        assert_eq!(got[1].id, a.id);
    }

    #[test]
    fn update_applies_patch() {
        let store = IndexStore::open_in_memory().unwrap();
        let memory = sample(Namespace::Blockers, "def5678", 0, "Rate limited");
        store.upsert(&memory, None).unwrap();

        let updated = store
            .update(&memory.id, &MemoryPatch::status(MemoryStatus::Resolved))
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, MemoryStatus::Resolved);
        assert_eq!(
            store.get(&memory.id).unwrap().unwrap().status,
            MemoryStatus::Resolved
        );

        let missing = MemoryId::new(Namespace::Blockers, "def5678", 3);
        assert!(store
            .update(&missing, &MemoryPatch::status(MemoryStatus::Resolved))
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_removes_all_rows() {
        let store = IndexStore::open_in_memory().unwrap();
        store.init_vectors(4, "mock").unwrap();
        let memory = sample(Namespace::Decisions, "abc1234", 0, "x");
        store.upsert(&memory, Some(&[0.1, 0.2, 0.3, 0.4])).unwrap();

        assert!(store.delete(&memory.id).unwrap());
        assert!(!store.delete(&memory.id).unwrap());
        assert!(store.get(&memory.id).unwrap().is_none());
        assert!(store.verify().unwrap().is_clean());
    }

    #[test]
    fn list_recent_orders_newest_first() {
        let store = IndexStore::open_in_memory().unwrap();
        let mut old = sample(Namespace::Progress, "abc1234", 0, "old");
        old.timestamp = mnemo_types::now() - chrono::Duration::days(2);
        let new = sample(Namespace::Progress, "abc1234", 1, "new");
        store.upsert(&old, None).unwrap();
        store.upsert(&new, None).unwrap();

        let recent = store
            .list_recent(None, Some(Namespace::Progress), 10)
            .unwrap();
        assert_eq!(recent[0].summary, "new");
        assert_eq!(recent[1].summary, "old");

        let capped = store.list_recent(None, None, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn ids_for_note_scopes_by_namespace() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .upsert(&sample(Namespace::Decisions, "abc1234", 0, "a"), None)
            .unwrap();
        store
            .upsert(&sample(Namespace::Decisions, "abc1234", 1, "b"), None)
            .unwrap();
        store
            .upsert(&sample(Namespace::Learnings, "abc1234", 0, "c"), None)
            .unwrap();

        let ids = store
            .ids_for_note(Path::new("/tmp/repo"), "abc1234", Namespace::Decisions)
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn upsert_batch_chunks_and_counts() {
        let store = IndexStore::open_in_memory().unwrap();
        let memories: Vec<Memory> = (0..25)
            .map(|i| sample(Namespace::Research, "abc1234", i, &format!("m{i}")))
            .collect();
        let written = store.upsert_batch(&memories, None).unwrap();
        assert_eq!(written, 25);
        assert_eq!(store.stats(None).unwrap().total, 25);
    }

    #[test]
    fn touch_records_access() {
        let store = IndexStore::open_in_memory().unwrap();
        let memory = sample(Namespace::Decisions, "abc1234", 0, "x");
        store.upsert(&memory, None).unwrap();
        store.touch(&memory.id).unwrap();
        assert!(store.last_accessed(&memory.id).unwrap().is_some());
    }
}
