//! The embedded index store.
//!
//! Single SQLite file holding three derived tables: `memories` (scalar
//! rows), `memory_vectors` (sqlite-vec ANN), and `memories_fts` (FTS5).
//! Git notes remain authoritative; everything here can be rebuilt from
//! them. Uses WAL mode; a mutex serializes all writes through the single
//! connection.

mod memory_ops;
mod search;

pub use memory_ops::MemoryPatch;
pub use search::SearchFilters;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info};

use mnemo_types::Timestamp;

use crate::error::{IndexError, IndexResult};
use crate::vector;

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 2;

/// Index store backed by SQLite.
pub struct IndexStore {
    pub(crate) conn: Mutex<Connection>,
    /// Embedding dimension the vector table was created with, once
    /// initialized.
    pub(crate) vector_dim: Mutex<Option<usize>>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("vector_dim", &self.vector_dim)
            .finish_non_exhaustive()
    }
}

/// Index statistics for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub by_namespace: BTreeMap<String, usize>,
    pub by_spec: BTreeMap<String, usize>,
    pub embedding_count: usize,
    pub size_bytes: u64,
    pub last_capture: Option<Timestamp>,
    pub schema_version: i32,
}

/// Referential drift found by [`IndexStore::verify`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct VerificationReport {
    /// Vector rows with no matching memory row.
    pub orphan_vectors: Vec<String>,
    /// FTS rows with no matching memory row.
    pub orphan_fts: Vec<String>,
    /// Memories that have no vector row (legitimate when embedding failed).
    pub memories_without_vector: usize,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_vectors.is_empty() && self.orphan_fts.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initialization
// ─────────────────────────────────────────────────────────────────────────────

impl IndexStore {
    /// Open or create the index at `path`.
    ///
    /// Registers sqlite-vec, enables WAL, runs migrations, and checks the
    /// file for corruption; a corrupt file surfaces as
    /// [`IndexError::Corrupt`] whose recovery action is a full rebuild.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| IndexError::Schema(format!("cannot create {parent:?}: {e}")))?;
            }
        }

        vector::init_vector_extension();

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, msg)
                if inner.code == rusqlite::ErrorCode::NotADatabase =>
            {
                IndexError::Corrupt(msg.unwrap_or_else(|| "file is not a database".into()))
            }
            other => IndexError::Database(other),
        })?;

        let store = Self {
            conn: Mutex::new(conn),
            vector_dim: Mutex::new(None),
        };
        store.initialize()?;

        info!("index store opened at {:?}", path);
        Ok(store)
    }

    /// Create an in-memory index (tests and dry runs).
    pub fn open_in_memory() -> IndexResult<Self> {
        vector::init_vector_extension();
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            vector_dim: Mutex::new(None),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();

        // Corruption check before anything touches the file, so a damaged
        // index surfaces with its rebuild guidance instead of a generic
        // database error.
        let check: String = conn
            .pragma_query_value(None, "quick_check", |row| row.get(0))
            .unwrap_or_else(|_| "failed".to_string());
        if check != "ok" {
            return Err(IndexError::Corrupt(check));
        }

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        self.create_schema(&conn)?;
        Ok(())
    }

    /// Create the schema and apply forward-only migrations.
    ///
    /// Each migration runs inside one transaction together with the version
    /// bump; an interrupted migration leaves the version unchanged.
    fn create_schema(&self, conn: &Connection) -> IndexResult<()> {
        let current: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current >= SCHEMA_VERSION {
            debug!("schema up to date (version {})", current);
            return Ok(());
        }
        info!("migrating schema from version {} to {}", current, SCHEMA_VERSION);

        if current < 1 {
            self.migrate(conn, 1, |conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS memories (
                        id TEXT PRIMARY KEY,
                        commit_sha TEXT NOT NULL,
                        namespace TEXT NOT NULL,
                        summary TEXT NOT NULL,
                        body TEXT NOT NULL DEFAULT '',
                        tags_json TEXT NOT NULL DEFAULT '[]',
                        timestamp TEXT NOT NULL,
                        spec TEXT,
                        phase TEXT,
                        status TEXT NOT NULL DEFAULT 'active',
                        relates_to_json TEXT NOT NULL DEFAULT '[]',
                        repo_path TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_memories_ns_spec_ts
                        ON memories(namespace, spec, timestamp DESC);
                    CREATE INDEX IF NOT EXISTS idx_memories_status_ts
                        ON memories(status, timestamp);
                    CREATE INDEX IF NOT EXISTS idx_memories_repo_ns
                        ON memories(repo_path, namespace);
                    CREATE INDEX IF NOT EXISTS idx_memories_commit
                        ON memories(commit_sha);

                    -- Last-seen note blob per (repo, commit, namespace),
                    -- driving incremental sync.
                    CREATE TABLE IF NOT EXISTS sync_state (
                        repo_path TEXT NOT NULL,
                        commit_sha TEXT NOT NULL,
                        namespace TEXT NOT NULL,
                        note_blob_sha TEXT NOT NULL,
                        synced_at TEXT NOT NULL,
                        PRIMARY KEY (repo_path, commit_sha, namespace)
                    );

                    CREATE TABLE IF NOT EXISTS meta (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );
                    "#,
                )?;
                conn.execute_batch(crate::fts::FTS_SCHEMA)?;
                Ok(())
            })?;
        }

        if current < 2 {
            self.migrate(conn, 2, |conn| {
                // Access tracking for lifecycle decay decisions.
                let has_column = conn
                    .prepare("SELECT last_accessed FROM memories LIMIT 0")
                    .is_ok();
                if !has_column {
                    conn.execute_batch(
                        "ALTER TABLE memories ADD COLUMN last_accessed TEXT;",
                    )?;
                }
                conn.execute(
                    "UPDATE memories SET last_accessed = updated_at WHERE last_accessed IS NULL",
                    [],
                )?;
                Ok(())
            })?;
        }

        Ok(())
    }

    fn migrate<F>(&self, conn: &Connection, version: i32, body: F) -> IndexResult<()>
    where
        F: FnOnce(&Connection) -> IndexResult<()>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match body(conn).and_then(|()| {
            conn.pragma_update(None, "user_version", version)?;
            Ok(())
        }) {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                info!("migration to version {} complete", version);
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(IndexError::Migration {
                    version,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Initialize vector search with a fixed dimension.
    ///
    /// The dimension is recorded in the meta table; opening an index whose
    /// stored dimension differs is a hard error — mixing dimensions would
    /// silently corrupt distances.
    pub fn init_vectors(&self, dim: usize, provider: &str) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();

        let stored: Option<usize> = get_meta_locked(&conn, "embedding.dimensions")?
            .and_then(|s| s.parse().ok());
        if let Some(stored_dim) = stored {
            if stored_dim != dim {
                return Err(IndexError::Schema(format!(
                    "embedding dimension mismatch: index has {stored_dim}, configured {dim}"
                )));
            }
        }

        vector::create_vector_table(&conn, dim)?;
        set_meta_locked(&conn, "embedding.dimensions", &dim.to_string())?;
        set_meta_locked(&conn, "embedding.provider", provider)?;
        *self.vector_dim.lock().unwrap() = Some(dim);
        Ok(())
    }

    /// Drop and recreate the vector table with a new dimension.
    ///
    /// Only the full reindex path calls this; every existing vector row is
    /// lost by design.
    pub fn reset_vectors(&self, dim: usize, provider: &str) -> IndexResult<()> {
        {
            let conn = self.conn.lock().unwrap();
            vector::drop_vector_table(&conn)?;
            vector::create_vector_table(&conn, dim)?;
            set_meta_locked(&conn, "embedding.dimensions", &dim.to_string())?;
            set_meta_locked(&conn, "embedding.provider", provider)?;
        }
        *self.vector_dim.lock().unwrap() = Some(dim);
        Ok(())
    }

    pub(crate) fn expected_dim(&self) -> IndexResult<usize> {
        self.vector_dim.lock().unwrap().ok_or_else(|| {
            IndexError::Schema("vector table not initialized; call init_vectors first".into())
        })
    }

    /// Execute a closure within a single transaction.
    pub fn with_transaction<F, T>(&self, f: F) -> IndexResult<T>
    where
        F: FnOnce(&Connection) -> IndexResult<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| IndexError::Txn(e.to_string()))?;
        match f(&tx) {
            Ok(result) => {
                tx.commit().map_err(|e| IndexError::Txn(e.to_string()))?;
                Ok(result)
            }
            // Dropping the transaction rolls it back.
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Meta
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> IndexResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        get_meta_locked(&conn, key)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();
        set_meta_locked(&conn, key, value)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    /// Last-seen note blob sha for `(repo, commit, namespace)`.
    pub fn note_state(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        namespace: &str,
    ) -> IndexResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT note_blob_sha FROM sync_state
             WHERE repo_path = ?1 AND commit_sha = ?2 AND namespace = ?3",
        )?;
        let mut rows = stmt.query(params![path_str(repo_path), commit_sha, namespace])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Record the note blob sha just synced.
    pub fn set_note_state(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        namespace: &str,
        note_blob_sha: &str,
    ) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sync_state
             (repo_path, commit_sha, namespace, note_blob_sha, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path_str(repo_path),
                commit_sha,
                namespace,
                note_blob_sha,
                mnemo_types::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All sync records for a repo and namespace.
    pub fn note_states(
        &self,
        repo_path: &Path,
        namespace: &str,
    ) -> IndexResult<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT commit_sha, note_blob_sha FROM sync_state
             WHERE repo_path = ?1 AND namespace = ?2",
        )?;
        let rows = stmt.query_map(params![path_str(repo_path), namespace], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Forget a sync record (the note disappeared).
    pub fn clear_note_state(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        namespace: &str,
    ) -> IndexResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_state
             WHERE repo_path = ?1 AND commit_sha = ?2 AND namespace = ?3",
            params![path_str(repo_path), commit_sha, namespace],
        )?;
        Ok(())
    }

    /// Drop every derived row: memories, vectors, FTS, and sync state.
    /// The meta table (including the embedding dimension) survives.
    pub fn truncate_derived(&self) -> IndexResult<()> {
        self.with_transaction(|conn| {
            conn.execute("DELETE FROM memories", [])?;
            conn.execute("DELETE FROM memories_fts", [])?;
            conn.execute("DELETE FROM sync_state", [])?;
            Ok(())
        })?;
        // The vec0 virtual table dislikes running inside the same
        // transaction as ordinary tables on some builds; clear it on its
        // own.
        let conn = self.conn.lock().unwrap();
        if conn
            .prepare("SELECT COUNT(*) FROM memory_vectors LIMIT 1")
            .is_ok()
        {
            conn.execute("DELETE FROM memory_vectors", [])?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stats and verification
    // ─────────────────────────────────────────────────────────────────────

    /// Aggregate statistics, optionally scoped to one repository.
    pub fn stats(&self, repo_path: Option<&Path>) -> IndexResult<IndexStats> {
        let conn = self.conn.lock().unwrap();

        let (scope_sql, scope_param) = match repo_path {
            Some(p) => (" WHERE repo_path = ?1", Some(path_str(p))),
            None => ("", None),
        };

        let count_sql = format!("SELECT COUNT(*) FROM memories{scope_sql}");
        let total: i64 = match &scope_param {
            Some(p) => conn.query_row(&count_sql, params![p], |row| row.get(0))?,
            None => conn.query_row(&count_sql, [], |row| row.get(0))?,
        };

        let mut by_namespace = BTreeMap::new();
        let ns_sql =
            format!("SELECT namespace, COUNT(*) FROM memories{scope_sql} GROUP BY namespace");
        let mut stmt = conn.prepare(&ns_sql)?;
        let mut collect = |rows: &mut rusqlite::Rows<'_>| -> IndexResult<()> {
            while let Some(row) = rows.next()? {
                let ns: String = row.get(0)?;
                let n: i64 = row.get(1)?;
                by_namespace.insert(ns, n as usize);
            }
            Ok(())
        };
        match &scope_param {
            Some(p) => collect(&mut stmt.query(params![p])?)?,
            None => collect(&mut stmt.query([])?)?,
        }

        let mut by_spec = BTreeMap::new();
        let spec_sql = format!(
            "SELECT spec, COUNT(*) FROM memories{scope_sql}{} GROUP BY spec",
            if scope_sql.is_empty() {
                " WHERE spec IS NOT NULL"
            } else {
                " AND spec IS NOT NULL"
            }
        );
        let mut stmt = conn.prepare(&spec_sql)?;
        let mut collect = |rows: &mut rusqlite::Rows<'_>| -> IndexResult<()> {
            while let Some(row) = rows.next()? {
                let spec: String = row.get(0)?;
                let n: i64 = row.get(1)?;
                by_spec.insert(spec, n as usize);
            }
            Ok(())
        };
        match &scope_param {
            Some(p) => collect(&mut stmt.query(params![p])?)?,
            None => collect(&mut stmt.query([])?)?,
        }

        let last_sql = format!("SELECT MAX(timestamp) FROM memories{scope_sql}");
        let last_raw: Option<String> = match &scope_param {
            Some(p) => conn.query_row(&last_sql, params![p], |row| row.get(0))?,
            None => conn.query_row(&last_sql, [], |row| row.get(0))?,
        };
        let last_capture = last_raw.and_then(|s| parse_ts(&s).ok());

        let embedding_count = vector::count_embeddings(&conn).unwrap_or(0);

        let page_count: u64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: u64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        Ok(IndexStats {
            total: total as usize,
            by_namespace,
            by_spec,
            embedding_count,
            size_bytes: page_count * page_size,
            last_capture,
            schema_version: version,
        })
    }

    /// Scan for referential drift between the three tables.
    pub fn verify(&self) -> IndexResult<VerificationReport> {
        let conn = self.conn.lock().unwrap();

        let mut report = VerificationReport::default();

        let exists = |id: &str| -> IndexResult<bool> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        };

        if conn
            .prepare("SELECT COUNT(*) FROM memory_vectors LIMIT 1")
            .is_ok()
        {
            for id in vector::all_ids(&conn)? {
                if !exists(&id)? {
                    report.orphan_vectors.push(id);
                }
            }
        }
        for id in crate::fts::all_ids(&conn)? {
            if !exists(&id)? {
                report.orphan_fts.push(id);
            }
        }

        let without_vector: i64 = if conn
            .prepare("SELECT COUNT(*) FROM memory_vectors LIMIT 1")
            .is_ok()
        {
            conn.query_row(
                "SELECT COUNT(*) FROM memories m
                 WHERE NOT EXISTS (SELECT 1 FROM memory_vectors v WHERE v.id = m.id)",
                [],
                |row| row.get(0),
            )?
        } else {
            conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?
        };
        report.memories_without_vector = without_vector as usize;

        Ok(report)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn parse_ts(raw: &str) -> IndexResult<Timestamp> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| IndexError::Constraint(format!("bad timestamp '{raw}': {e}")))
}

fn get_meta_locked(conn: &Connection, key: &str) -> IndexResult<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn set_meta_locked(conn: &Connection, key: &str, value: &str) -> IndexResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let store = IndexStore::open_in_memory().unwrap();
        let stats = store.stats(None).unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn meta_round_trips() {
        let store = IndexStore::open_in_memory().unwrap();
        assert!(store.get_meta("k").unwrap().is_none());
        store.set_meta("k", "v").unwrap();
        assert_eq!(store.get_meta("k").unwrap().as_deref(), Some("v"));
        store.set_meta("k", "v2").unwrap();
        assert_eq!(store.get_meta("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn init_vectors_rejects_dimension_change() {
        let store = IndexStore::open_in_memory().unwrap();
        store.init_vectors(4, "mock").unwrap();
        store.init_vectors(4, "mock").unwrap();
        let err = store.init_vectors(8, "mock").unwrap_err();
        assert!(matches!(err, IndexError::Schema(_)));
    }

    #[test]
    fn reset_vectors_allows_dimension_change() {
        let store = IndexStore::open_in_memory().unwrap();
        store.init_vectors(4, "mock").unwrap();
        store.reset_vectors(8, "mock").unwrap();
        assert_eq!(
            store.get_meta("embedding.dimensions").unwrap().as_deref(),
            Some("8")
        );
    }

    #[test]
    fn sync_state_round_trips() {
        let store = IndexStore::open_in_memory().unwrap();
        let repo = Path::new("/tmp/repo");
        assert!(store.note_state(repo, "abc1234", "decisions").unwrap().is_none());

        store
            .set_note_state(repo, "abc1234", "decisions", "blob111")
            .unwrap();
        assert_eq!(
            store.note_state(repo, "abc1234", "decisions").unwrap().as_deref(),
            Some("blob111")
        );

        store
            .set_note_state(repo, "abc1234", "decisions", "blob222")
            .unwrap();
        assert_eq!(
            store.note_state(repo, "abc1234", "decisions").unwrap().as_deref(),
            Some("blob222")
        );

        let all = store.note_states(repo, "decisions").unwrap();
        assert_eq!(all, vec![("abc1234".to_string(), "blob222".to_string())]);

        store.clear_note_state(repo, "abc1234", "decisions").unwrap();
        assert!(store.note_state(repo, "abc1234", "decisions").unwrap().is_none());
    }

    #[test]
    fn persistent_file_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("index.db");
        {
            let store = IndexStore::open(&db).unwrap();
            store.set_meta("persisted", "yes").unwrap();
        }
        let store = IndexStore::open(&db).unwrap();
        assert_eq!(store.get_meta("persisted").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("index.db");
        std::fs::write(&db, b"this is definitely not a sqlite database, not even close").unwrap();
        let err = IndexStore::open(&db).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_) | IndexError::Database(_)));
        if let IndexError::Corrupt(_) = err {
            assert!(err.recovery_action().contains("sync full"));
        }
    }
}
