//! Hybrid index schema.
//!
//! One `chunks` table holds every notebook's rows (scoped by `notebook_id`)
//! with the dense vector stored as a little-endian f32 blob. A contentless-
//! sync FTS5 table provides the BM25 lexical layer; triggers keep it aligned
//! with the base table.

/// Current schema version, stored in the `meta` table.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Full schema, applied on first open.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    chunk_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    notebook_id TEXT NOT NULL,
    text TEXT NOT NULL,
    level TEXT NOT NULL,
    parent_id TEXT,
    section_title TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0,
    filename TEXT NOT NULL DEFAULT '',
    parent_text TEXT,
    vector BLOB NOT NULL,
    UNIQUE (notebook_id, chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_notebook ON chunks(notebook_id);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(notebook_id, source_id);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content='chunks',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_update AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;
";

/// Reads the stored schema version.
pub const GET_VERSION_SQL: &str = "SELECT value FROM meta WHERE key = 'schema_version'";

/// Writes the schema version.
pub const SET_VERSION_SQL: &str =
    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)";

/// Serializes a vector as a little-endian f32 blob.
#[must_use]
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserializes a little-endian f32 blob back into a vector.
#[must_use]
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_blob_round_trip() {
        let vector = vec![0.5, -1.25, 3.0, 0.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&vector)), vector);
    }

    #[test]
    fn test_empty_vector() {
        assert!(blob_to_vector(&vector_to_blob(&[])).is_empty());
    }

    #[test]
    fn test_blob_size() {
        assert_eq!(vector_to_blob(&[1.0; 1024]).len(), 4096);
    }
}
