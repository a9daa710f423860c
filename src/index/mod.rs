//! Per-notebook hybrid index.
//!
//! Dense retrieval stores fixed-dimension vectors alongside each chunk row
//! and ranks by exact cosine similarity; lexical retrieval uses the FTS5
//! BM25 scorer. Sources become visible atomically: an upsert runs in one
//! transaction under a notebook-scoped write lock, so readers see all of a
//! source's chunks or none of them.

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod schema;

use crate::core::{ChunkLevel, ChunkRecord};
use crate::embedding::cosine_similarity;
use crate::error::{IndexError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A scored search hit from either index layer.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matched chunk row.
    pub record: ChunkRecord,
    /// Layer score: cosine similarity for dense, BM25 (negated, higher is
    /// better) for lexical.
    pub score: f32,
}

/// Hybrid dense + lexical index over SQLite.
///
/// # Examples
///
/// ```
/// use carrel::index::HybridIndex;
///
/// let index = HybridIndex::in_memory(1024).unwrap();
/// assert_eq!(index.dimensions(), 1024);
/// ```
pub struct HybridIndex {
    conn: Mutex<Connection>,
    /// Per-notebook writer serialization; readers go straight to `conn`.
    write_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dimensions: usize,
    path: Option<PathBuf>,
}

impl HybridIndex {
    /// Opens or creates the index database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::Database(e.to_string()))?;
        }

        let conn = Connection::open(&path).map_err(IndexError::from)?;
        Self::init_conn(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            write_locks: std::sync::Mutex::new(HashMap::new()),
            dimensions,
            path: Some(path),
        })
    }

    /// Creates an in-memory index. Useful for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory(dimensions: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(IndexError::from)?;
        Self::init_conn(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            write_locks: std::sync::Mutex::new(HashMap::new()),
            dimensions,
            path: None,
        })
    }

    fn init_conn(conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(IndexError::from)?;
        // WAL only applies to file-backed databases; ignore result in-memory
        let _: std::result::Result<String, _> =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0));

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(IndexError::from)?;
        conn.execute(schema::SET_VERSION_SQL, params![
            schema::CURRENT_SCHEMA_VERSION.to_string()
        ])
        .map_err(IndexError::from)?;
        Ok(())
    }

    /// Returns the database path (`None` for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the configured vector dimension.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn notebook_lock(&self, notebook_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.write_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(notebook_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically adds a source's chunks to the notebook index.
    ///
    /// Replaces any existing rows for the same source ids in the batch, so a
    /// re-ingest never leaves duplicates. Readers observe either the old
    /// rows or the complete new set.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if any vector length does
    /// not match the configured dimension, or a database error.
    pub async fn upsert(&self, notebook_id: &str, records: &[ChunkRecord]) -> Result<usize> {
        for record in records {
            if record.vector.len() != self.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimensions,
                    found: record.vector.len(),
                }
                .into());
            }
        }

        let write_lock = self.notebook_lock(notebook_id);
        let _writer = write_lock.lock().await;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(IndexError::from)?;

        // Replace existing rows for the sources in this batch
        let mut source_ids: Vec<&str> = records.iter().map(|r| r.source_id.as_str()).collect();
        source_ids.sort_unstable();
        source_ids.dedup();
        for source_id in &source_ids {
            tx.execute(
                "DELETE FROM chunks WHERE notebook_id = ?1 AND source_id = ?2",
                params![notebook_id, source_id],
            )
            .map_err(IndexError::from)?;
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chunks
                     (chunk_id, source_id, notebook_id, text, level, parent_id,
                      section_title, position, filename, parent_text, vector)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(IndexError::from)?;

            for record in records {
                stmt.execute(params![
                    record.chunk_id,
                    record.source_id,
                    notebook_id,
                    record.text,
                    record.level.as_str(),
                    record.parent_id,
                    record.section_title,
                    record.position as i64,
                    record.filename,
                    record.parent_text,
                    schema::vector_to_blob(&record.vector),
                ])
                .map_err(IndexError::from)?;
            }
        }

        tx.commit().map_err(IndexError::from)?;
        debug!(notebook_id, rows = records.len(), "index upsert");
        Ok(records.len())
    }

    /// Removes every chunk for a source from both index layers.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn delete_source(&self, notebook_id: &str, source_id: &str) -> Result<usize> {
        let write_lock = self.notebook_lock(notebook_id);
        let _writer = write_lock.lock().await;

        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM chunks WHERE notebook_id = ?1 AND source_id = ?2",
                params![notebook_id, source_id],
            )
            .map_err(IndexError::from)?;
        debug!(notebook_id, source_id, removed, "index delete");
        Ok(removed)
    }

    /// Dense search: exact cosine similarity over the notebook's vectors.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn search_dense(
        &self,
        notebook_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare("SELECT id, vector FROM chunks WHERE notebook_id = ?1")
            .map_err(IndexError::from)?;
        let rows = stmt
            .query_map(params![notebook_id], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })
            .map_err(IndexError::from)?;

        let mut scored: Vec<(i64, f32)> = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(IndexError::from)?;
            let vector = schema::blob_to_vector(&blob);
            scored.push((id, cosine_similarity(query_vector, &vector)));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            if let Some(record) = Self::fetch_by_rowid(&conn, id)? {
                hits.push(SearchHit { record, score });
            }
        }
        Ok(hits)
    }

    /// Lexical search: FTS5 BM25 over the notebook's chunk text.
    ///
    /// The raw query is reduced to quoted word tokens joined with `OR` so
    /// user punctuation can never produce FTS syntax errors. Scores are
    /// negated BM25 ranks (higher is better).
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn search_lexical(
        &self,
        notebook_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT c.id, bm25(chunks_fts) AS rank
                 FROM chunks_fts
                 JOIN chunks c ON c.id = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1 AND c.notebook_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
            )
            .map_err(IndexError::from)?;

        let rows = stmt
            .query_map(params![fts_query, notebook_id, k as i64], |row| {
                let id: i64 = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((id, rank))
            })
            .map_err(IndexError::from)?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, rank) = row.map_err(IndexError::from)?;
            if let Some(record) = Self::fetch_by_rowid(&conn, id)? {
                hits.push(SearchHit {
                    record,
                    score: -(rank as f32),
                });
            }
        }
        Ok(hits)
    }

    /// Drops every row for a notebook. Used on dimension migrations and
    /// notebook deletion.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn drop_notebook(&self, notebook_id: &str) -> Result<usize> {
        let write_lock = self.notebook_lock(notebook_id);
        let _writer = write_lock.lock().await;

        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM chunks WHERE notebook_id = ?1",
                params![notebook_id],
            )
            .map_err(IndexError::from)?;
        info!(notebook_id, removed, "notebook index dropped");
        Ok(removed)
    }

    /// Counts chunks for a specific source.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn count_chunks(&self, notebook_id: &str, source_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE notebook_id = ?1 AND source_id = ?2",
                params![notebook_id, source_id],
                |row| row.get(0),
            )
            .map_err(IndexError::from)?;
        Ok(count as usize)
    }

    /// Counts all chunks for a notebook.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn count_notebook_chunks(&self, notebook_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE notebook_id = ?1",
                params![notebook_id],
                |row| row.get(0),
            )
            .map_err(IndexError::from)?;
        Ok(count as usize)
    }

    /// Fetches a chunk by its derived id.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn get_chunk(&self, notebook_id: &str, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let conn = self.conn.lock().await;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM chunks WHERE notebook_id = ?1 AND chunk_id = ?2",
                params![notebook_id, chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(IndexError::from)?;

        match id {
            Some(id) => Self::fetch_by_rowid(&conn, id),
            None => Ok(None),
        }
    }

    /// Returns the distinct source ids present in a notebook's index.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn source_ids(&self, notebook_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT DISTINCT source_id FROM chunks WHERE notebook_id = ?1")
            .map_err(IndexError::from)?;
        let rows = stmt
            .query_map(params![notebook_id], |row| row.get::<_, String>(0))
            .map_err(IndexError::from)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(IndexError::from)?);
        }
        Ok(ids)
    }

    /// Removes rows whose source id is not in `valid_source_ids`.
    ///
    /// Integrity sweep for orphan rows left behind by interrupted deletes.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn sweep_orphans(
        &self,
        notebook_id: &str,
        valid_source_ids: &[String],
    ) -> Result<usize> {
        let present = self.source_ids(notebook_id).await?;
        let valid: std::collections::HashSet<&str> =
            valid_source_ids.iter().map(String::as_str).collect();

        let mut removed = 0;
        for source_id in present {
            if !valid.contains(source_id.as_str()) {
                removed += self.delete_source(notebook_id, &source_id).await?;
            }
        }
        if removed > 0 {
            info!(notebook_id, removed, "orphan rows swept");
        }
        Ok(removed)
    }

    /// Deletes every chunk row. Used when a dimension migration requires a
    /// full rebuild.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn reset(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM chunks", [])
            .map_err(IndexError::from)?;
        info!(removed, "index reset");
        Ok(removed)
    }

    /// Samples the vector dimension of an arbitrary stored row.
    ///
    /// Returns `None` when the index is empty. Used by the migration check.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn sample_dimension(&self) -> Result<Option<usize>> {
        let conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT vector FROM chunks LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(IndexError::from)?;
        Ok(blob.map(|b| b.len() / 4))
    }

    fn fetch_by_rowid(conn: &Connection, id: i64) -> Result<Option<ChunkRecord>> {
        conn.query_row(
            "SELECT chunk_id, source_id, notebook_id, text, level, parent_id,
                    section_title, position, filename, parent_text, vector
             FROM chunks WHERE id = ?1",
            params![id],
            |row| {
                Ok(ChunkRecord {
                    chunk_id: row.get(0)?,
                    source_id: row.get(1)?,
                    notebook_id: row.get(2)?,
                    text: row.get(3)?,
                    level: ChunkLevel::parse(&row.get::<_, String>(4)?),
                    parent_id: row.get(5)?,
                    section_title: row.get(6)?,
                    position: row.get::<_, i64>(7)? as usize,
                    filename: row.get(8)?,
                    parent_text: row.get(9)?,
                    vector: schema::blob_to_vector(&row.get::<_, Vec<u8>>(10)?),
                })
            },
        )
        .optional()
        .map_err(|e| IndexError::from(e).into())
    }
}

/// Reduces free text to a safe FTS5 query: quoted word tokens joined by OR.
fn build_fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, FallbackEmbedder};

    const DIMS: usize = 64;

    fn record(notebook: &str, source: &str, chunk: &str, text: &str) -> ChunkRecord {
        let embedder = FallbackEmbedder::new(DIMS);
        ChunkRecord {
            chunk_id: chunk.to_string(),
            source_id: source.to_string(),
            notebook_id: notebook.to_string(),
            text: text.to_string(),
            level: ChunkLevel::Paragraph,
            parent_id: Some(format!("{source}_doc")),
            section_title: String::new(),
            position: 0,
            filename: "test.txt".to_string(),
            parent_text: None,
            vector: embedder.embed(text).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_count() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        let records = vec![
            record("nb", "s1", "s1_c0", "the quick brown fox"),
            record("nb", "s1", "s1_c1", "jumps over the lazy dog"),
        ];
        assert_eq!(index.upsert("nb", &records).await.unwrap(), 2);
        assert_eq!(index.count_chunks("nb", "s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_source_rows() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[record("nb", "s1", "s1_c0", "old text")])
            .await
            .unwrap();
        index
            .upsert("nb", &[
                record("nb", "s1", "s1_c0", "new text"),
                record("nb", "s1", "s1_c1", "more text"),
            ])
            .await
            .unwrap();
        assert_eq!(index.count_chunks("nb", "s1").await.unwrap(), 2);
        let chunk = index.get_chunk("nb", "s1_c0").await.unwrap().unwrap();
        assert_eq!(chunk.text, "new text");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        let mut bad = record("nb", "s1", "s1_c0", "text");
        bad.vector = vec![0.0; 32];
        let err = index.upsert("nb", &[bad]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Index(IndexError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_source_removes_all_layers() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[
                record("nb", "s1", "s1_c0", "alpha beta gamma"),
                record("nb", "s2", "s2_c0", "delta epsilon"),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete_source("nb", "s1").await.unwrap(), 1);
        assert_eq!(index.count_chunks("nb", "s1").await.unwrap(), 0);
        // Lexical layer no longer returns the deleted chunk
        let hits = index.search_lexical("nb", "alpha", 10).await.unwrap();
        assert!(hits.is_empty());
        // Other source untouched
        assert_eq!(index.count_chunks("nb", "s2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dense_search_ranks_by_similarity() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[
                record("nb", "s1", "s1_c0", "rust systems programming language"),
                record("nb", "s1", "s1_c1", "cooking pasta with tomato sauce"),
            ])
            .await
            .unwrap();

        let embedder = FallbackEmbedder::new(DIMS);
        let query = embedder.embed("rust programming").unwrap();
        let hits = index.search_dense("nb", &query, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chunk_id, "s1_c0");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_lexical_search_bm25() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[
                record("nb", "s1", "s1_c0", "chris ran seven demos in the quarter"),
                record("nb", "s1", "s1_c1", "unrelated content about gardening"),
            ])
            .await
            .unwrap();

        let hits = index.search_lexical("nb", "demos quarter", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.chunk_id, "s1_c0");
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_lexical_search_punctuation_safe() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[record("nb", "s1", "s1_c0", "revenue was high")])
            .await
            .unwrap();
        // FTS operators in the raw query must not error
        let hits = index
            .search_lexical("nb", "revenue AND (high OR \"low\") *", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_notebook_isolation() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb1", &[record("nb1", "s1", "s1_c0", "shared words here")])
            .await
            .unwrap();
        index
            .upsert("nb2", &[record("nb2", "s2", "s2_c0", "shared words here")])
            .await
            .unwrap();

        let hits = index.search_lexical("nb1", "shared", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.notebook_id, "nb1");
    }

    #[tokio::test]
    async fn test_drop_notebook() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[record("nb", "s1", "s1_c0", "content")])
            .await
            .unwrap();
        index.drop_notebook("nb").await.unwrap();
        assert_eq!(index.count_notebook_chunks("nb").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        index
            .upsert("nb", &[
                record("nb", "s1", "s1_c0", "kept"),
                record("nb", "s2", "s2_c0", "orphaned"),
            ])
            .await
            .unwrap();

        let removed = index
            .sweep_orphans("nb", &["s1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count_chunks("nb", "s2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sample_dimension() {
        let index = HybridIndex::in_memory(DIMS).unwrap();
        assert_eq!(index.sample_dimension().await.unwrap(), None);
        index
            .upsert("nb", &[record("nb", "s1", "s1_c0", "text")])
            .await
            .unwrap();
        assert_eq!(index.sample_dimension().await.unwrap(), Some(DIMS));
    }

    #[test]
    fn test_build_fts_query() {
        assert_eq!(
            build_fts_query("hello world").as_deref(),
            Some("\"hello\" OR \"world\"")
        );
        assert!(build_fts_query("!!!").is_none());
    }
}
