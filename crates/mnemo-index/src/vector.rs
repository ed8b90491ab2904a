//! Vector storage and KNN search using sqlite-vec.

use rusqlite::{params, Connection};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use crate::error::{IndexError, IndexResult};

/// Default embedding dimension (MiniLM-L6-v2 produces 384-dim vectors).
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Register the sqlite-vec extension for all connections in this process.
///
/// Must run before the first connection that touches vector tables is
/// opened; `sqlite3_auto_extension` applies process-wide.
pub fn init_vector_extension() {
    use rusqlite::ffi::sqlite3_auto_extension;
    use sqlite_vec::sqlite3_vec_init;

    unsafe {
        #[allow(clippy::missing_transmute_annotations)]
        sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
    }
}

/// Create the vec0 virtual table for memory embeddings.
pub fn create_vector_table(conn: &Connection, dim: usize) -> IndexResult<()> {
    let sql = format!(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_vectors USING vec0(
            id TEXT PRIMARY KEY,
            embedding FLOAT[{dim}]
        )
        "#
    );
    conn.execute_batch(&sql)?;
    info!("created memory_vectors table with {} dimensions", dim);
    Ok(())
}

/// Drop the vector table. Used when rebuilding with new dimensions.
pub fn drop_vector_table(conn: &Connection) -> IndexResult<()> {
    conn.execute_batch("DROP TABLE IF EXISTS memory_vectors")?;
    Ok(())
}

/// Store an embedding, replacing any existing row for the id.
pub fn store_embedding(
    conn: &Connection,
    id: &str,
    embedding: &[f32],
    expected_dim: usize,
) -> IndexResult<()> {
    if embedding.len() != expected_dim {
        return Err(IndexError::Constraint(format!(
            "embedding dimension mismatch: expected {expected_dim}, got {}",
            embedding.len()
        )));
    }
    if embedding.iter().any(|v| v.is_nan() || v.is_infinite()) {
        return Err(IndexError::Constraint(
            "embedding contains NaN or infinite values".into(),
        ));
    }

    // vec0 does not support INSERT OR REPLACE; delete first.
    conn.execute("DELETE FROM memory_vectors WHERE id = ?1", params![id])?;
    conn.execute(
        "INSERT INTO memory_vectors (id, embedding) VALUES (?1, ?2)",
        params![id, embedding.as_bytes()],
    )?;
    debug!(id, "stored embedding");
    Ok(())
}

/// Delete the embedding for an id. Returns whether a row was removed.
pub fn delete_embedding(conn: &Connection, id: &str) -> IndexResult<bool> {
    let rows = conn.execute("DELETE FROM memory_vectors WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Whether an embedding exists for the id.
pub fn has_embedding(conn: &Connection, id: &str) -> IndexResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_vectors WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Count stored embeddings.
pub fn count_embeddings(conn: &Connection) -> IndexResult<usize> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM memory_vectors", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// A raw KNN hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub distance: f32,
}

/// Top-`limit` nearest ids by ascending distance.
pub fn knn(conn: &Connection, query: &[f32], limit: usize) -> IndexResult<Vec<VectorHit>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, distance
        FROM memory_vectors
        WHERE embedding MATCH ?1
        ORDER BY distance
        LIMIT ?2
        "#,
    )?;

    let mut rows = stmt.query(params![query.as_bytes(), limit as i64])?;
    let mut hits = Vec::new();
    while let Some(row) = rows.next()? {
        hits.push(VectorHit {
            id: row.get(0)?,
            distance: row.get(1)?,
        });
    }
    debug!("knn returned {} hits (limit {})", hits.len(), limit);
    Ok(hits)
}

/// Every id present in the vector table.
pub fn all_ids(conn: &Connection) -> IndexResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM memory_vectors")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
