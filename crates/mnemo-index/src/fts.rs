//! Full-text search over summaries and bodies.
//!
//! The FTS table is maintained manually alongside `memories` rather than by
//! triggers, so upserts stay a single explicit transaction.

use rusqlite::{params, Connection};

use crate::error::IndexResult;

pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id UNINDEXED,
    summary,
    body,
    tokenize = 'unicode61'
)
"#;

/// Insert (or refresh) the FTS row for a memory.
pub fn upsert(conn: &Connection, id: &str, summary: &str, body: &str) -> IndexResult<()> {
    conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![id])?;
    conn.execute(
        "INSERT INTO memories_fts (id, summary, body) VALUES (?1, ?2, ?3)",
        params![id, summary, body],
    )?;
    Ok(())
}

/// Remove the FTS row for a memory.
pub fn delete(conn: &Connection, id: &str) -> IndexResult<()> {
    conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![id])?;
    Ok(())
}

/// Ids present in FTS; used by verification.
pub fn all_ids(conn: &Connection) -> IndexResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM memories_fts")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Escape a user query for FTS5 MATCH.
///
/// Every whitespace-separated token becomes a quoted phrase, which disarms
/// FTS5 operator syntax (`AND`, `NEAR`, `*`, column filters) in user input.
pub fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
