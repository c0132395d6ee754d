//! Chunk Store - rusqlite-backed chunk table with FTS5 keyword search
//!
//! Holds chunk text and provenance; the lexical retrieval path.
//! Default location: ~/.arxiv-rag/chunks.db

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde::Serialize;

use crate::error::{RagError, Result};

use super::index::SearchFilter;
use super::types::{Chunk, ChunkMetadata, ChunkType};

// ============================================================================
// Data Directory
// ============================================================================

/// Data directory (~/.arxiv-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".arxiv-rag")
}

// ============================================================================
// Types
// ============================================================================

/// Store totals
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub document_count: usize,
    pub total_content_bytes: usize,
    pub db_path: PathBuf,
}

const CHUNK_COLUMNS: &str = "c.chunk_id, c.document_id, c.chunk_index, c.content, c.section_title, \
     c.chunk_type, c.token_count, c.char_count, c.content_hash, c.arxiv_id, c.title, \
     c.categories, c.published_date";

// ============================================================================
// ChunkStore
// ============================================================================

/// SQLite chunk table plus an external-content FTS5 index over it
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    fts_enabled: bool,
}

impl ChunkStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagError::lexical_index(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagError::lexical_index(format!("Failed to open SQLite database: {}", e)))?;

        let fts_enabled = Self::initialize(&conn)?;
        tracing::debug!("Chunk store initialized at {:?} (fts5: {})", path, fts_enabled);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            fts_enabled,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RagError::Internal(format!("Lock error: {}", e)))
    }

    /// Create tables; returns whether FTS5 is available
    fn initialize(conn: &Connection) -> Result<bool> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id TEXT NOT NULL UNIQUE,
                document_id TEXT NOT NULL,
                arxiv_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                section_title TEXT,
                chunk_type TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                char_count INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                categories TEXT NOT NULL DEFAULT '[]',
                published_date TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);",
        )
        .map_err(|e| RagError::lexical_index(format!("Failed to create chunks table: {}", e)))?;

        // source: https://www.sqlite.org/fts5.html#external_content_tables
        let fts_result = conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                title,
                section_title,
                content,
                content=chunks,
                content_rowid=id
            )",
            [],
        );

        if let Err(e) = fts_result {
            tracing::warn!("FTS5 not available, lexical search disabled: {}", e);
            return Ok(false);
        }

        conn.execute_batch(
            r#"
            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, title, section_title, content)
                VALUES (new.id, new.title, new.section_title, new.content);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, title, section_title, content)
                VALUES('delete', old.id, old.title, old.section_title, old.content);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, title, section_title, content)
                VALUES('delete', old.id, old.title, old.section_title, old.content);
                INSERT INTO chunks_fts(rowid, title, section_title, content)
                VALUES (new.id, new.title, new.section_title, new.content);
            END;
            "#,
        )
        .map_err(|e| RagError::lexical_index(format!("Failed to create FTS5 triggers: {}", e)))?;

        Ok(true)
    }

    /// Insert chunks, replacing rows with the same chunk id
    pub fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(RagError::lexical_index)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chunks (chunk_id, document_id, arxiv_id, title, content,
                        section_title, chunk_type, chunk_index, token_count, char_count,
                        content_hash, categories, published_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(chunk_id) DO UPDATE SET
                        document_id = excluded.document_id,
                        arxiv_id = excluded.arxiv_id,
                        title = excluded.title,
                        content = excluded.content,
                        section_title = excluded.section_title,
                        chunk_type = excluded.chunk_type,
                        chunk_index = excluded.chunk_index,
                        token_count = excluded.token_count,
                        char_count = excluded.char_count,
                        content_hash = excluded.content_hash,
                        categories = excluded.categories,
                        published_date = excluded.published_date",
                )
                .map_err(RagError::lexical_index)?;

            for chunk in chunks {
                let categories = serde_json::to_string(&chunk.metadata.categories)
                    .map_err(|e| RagError::Internal(e.to_string()))?;
                stmt.execute(params![
                    chunk.id,
                    chunk.document_id,
                    chunk.metadata.arxiv_id,
                    chunk.metadata.title,
                    chunk.content,
                    chunk.section_title,
                    chunk.chunk_type.as_str(),
                    chunk.chunk_index as i64,
                    chunk.token_count as i64,
                    chunk.char_count as i64,
                    chunk.content_hash,
                    categories,
                    chunk.metadata.published_date.map(|d| d.to_string()),
                ])
                .map_err(RagError::lexical_index)?;
            }
        }

        tx.commit().map_err(RagError::lexical_index)?;
        Ok(chunks.len())
    }

    /// FTS5 keyword search over chunks matching `filter`, best first
    ///
    /// Scores are negated `bm25()` so higher is better.
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    pub fn search_fts(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(Chunk, f64)>> {
        if !self.fts_enabled {
            return Err(RagError::lexical_index("FTS5 is not available"));
        }

        let match_query = escape_fts5_query(query);
        if match_query.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut values = vec![Value::Text(match_query)];
        let filter_sql = filter_clause(filter, &mut values);
        values.push(Value::Integer(limit as i64));

        let conn = self.lock()?;
        let sql = format!(
            "SELECT {}, bm25(chunks_fts) AS bm25_score
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             WHERE chunks_fts MATCH ?{}
             ORDER BY bm25(chunks_fts), c.document_id, c.chunk_index
             LIMIT ?",
            CHUNK_COLUMNS, filter_sql
        );
        let mut stmt = conn.prepare(&sql).map_err(RagError::lexical_index)?;

        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let chunk = row_to_chunk(row)?;
                let bm25: f64 = row.get(13)?;
                Ok((chunk, -bm25))
            })
            .map_err(RagError::lexical_index)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(RagError::lexical_index)
    }

    /// Fetch chunks by id (missing ids are absent from the map)
    pub fn get_chunks(&self, ids: &[String]) -> Result<HashMap<String, Chunk>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM chunks c WHERE c.chunk_id IN ({})",
            CHUNK_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql).map_err(RagError::lexical_index)?;

        let rows = stmt
            .query_map(params_from_iter(ids.iter()), row_to_chunk)
            .map_err(RagError::lexical_index)?;

        let mut found = HashMap::with_capacity(ids.len());
        for row in rows {
            let chunk = row.map_err(RagError::lexical_index)?;
            found.insert(chunk.id.clone(), chunk);
        }
        Ok(found)
    }

    /// Remove chunks by id; returns rows removed
    pub fn delete_chunks(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        conn.execute(
            &format!("DELETE FROM chunks WHERE chunk_id IN ({})", placeholders),
            params_from_iter(ids.iter()),
        )
        .map_err(RagError::lexical_index)
    }

    pub fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(RagError::lexical_index)
    }

    pub fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(RagError::lexical_index)?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let (chunks, documents, bytes): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT document_id), COALESCE(SUM(LENGTH(content)), 0)
                 FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(RagError::lexical_index)?;

        Ok(StoreStats {
            chunk_count: chunks as usize,
            document_count: documents as usize,
            total_content_bytes: bytes as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get(5)?;
    let categories: String = row.get(11)?;
    let published: Option<String> = row.get(12)?;

    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        chunk_index: row.get::<_, i64>(2)? as u32,
        content: row.get(3)?,
        section_title: row.get(4)?,
        chunk_type: ChunkType::parse(&chunk_type).unwrap_or(ChunkType::Body),
        token_count: row.get::<_, i64>(6)? as usize,
        char_count: row.get::<_, i64>(7)? as usize,
        content_hash: row.get(8)?,
        metadata: ChunkMetadata {
            arxiv_id: row.get(9)?,
            title: row.get(10)?,
            categories: serde_json::from_str(&categories).unwrap_or_default(),
            published_date: published.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        },
    })
}

/// `AND ...` conditions for `filter` over the `c` alias, pushing their
/// bound values onto `values`
///
/// Categories are stored as a JSON array and matched with `json_each`.
/// source: https://www.sqlite.org/json1.html#jeach
fn filter_clause(filter: &SearchFilter, values: &mut Vec<Value>) -> String {
    let mut sql = String::new();

    if !filter.categories.is_empty() {
        let placeholders = vec!["?"; filter.categories.len()].join(", ");
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(c.categories) WHERE json_each.value IN ({}))",
            placeholders
        ));
        values.extend(filter.categories.iter().cloned().map(Value::Text));
    }

    if let Some(after) = filter.published_after {
        // ISO dates compare correctly as text; NULL never passes
        sql.push_str(" AND c.published_date >= ?");
        values.push(Value::Text(after.to_string()));
    }

    sql
}

/// Build an FTS5 MATCH expression from free text
///
/// Each word is stripped of special characters and quoted, and words are
/// OR-ed so BM25 ranks partial matches instead of requiring all terms.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn escape_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::chunk;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = ChunkStore::open(&db_path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_upsert_and_get_chunks() {
        let (_dir, store) = create_test_store();
        let mut c = chunk("paper-1", 0, "Transformers use self-attention");
        c.metadata.categories = vec!["cs.CL".to_string()];
        c.metadata.published_date = NaiveDate::from_ymd_opt(2017, 6, 12);
        c.section_title = Some("Introduction".to_string());

        assert_eq!(store.upsert_chunks(&[c.clone()]).unwrap(), 1);

        let found = store.get_chunks(&[c.id.clone(), "missing".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&c.id], c);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let (_dir, store) = create_test_store();
        let mut c = chunk("paper-1", 0, "old text about cats");
        store.upsert_chunks(&[c.clone()]).unwrap();

        c.content = "new text about dogs".to_string();
        store.upsert_chunks(&[c.clone()]).unwrap();

        assert_eq!(store.count_for_document("paper-1").unwrap(), 1);
        assert!(store.search_fts("cats", 10, &SearchFilter::default()).unwrap().is_empty());
        assert_eq!(store.search_fts("dogs", 10, &SearchFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_search_fts_ranks_by_bm25() {
        let (_dir, store) = create_test_store();
        store
            .upsert_chunks(&[
                chunk("p1", 0, "retrieval augmented generation with retrieval"),
                chunk("p1", 1, "image classification benchmarks"),
                chunk("p2", 0, "generation of images"),
            ])
            .unwrap();

        let results = store.search_fts("retrieval generation", 10, &SearchFilter::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.document_id, "p1");
        assert!(results[0].1 >= results[1].1);

        assert!(store.search_fts("!!!", 10, &SearchFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_search_fts_filters_before_limit() {
        let (_dir, store) = create_test_store();
        let mut chunks = Vec::new();
        for i in 0..5 {
            let mut c = chunk("vision", i, "attention attention");
            c.metadata.categories = vec!["cs.CV".to_string()];
            c.metadata.published_date = NaiveDate::from_ymd_opt(2024, 1, 1);
            chunks.push(c);
        }
        let mut language = chunk("language", 0, "attention across a long document of prose");
        language.metadata.categories = vec!["cs.CL".to_string(), "cs.LG".to_string()];
        language.metadata.published_date = NaiveDate::from_ymd_opt(2023, 6, 1);
        chunks.push(language);
        let mut undated = chunk("undated", 0, "attention");
        undated.metadata.categories = vec!["cs.CV".to_string()];
        chunks.push(undated);
        store.upsert_chunks(&chunks).unwrap();

        let by_category = SearchFilter {
            categories: vec!["cs.LG".to_string()],
            ..Default::default()
        };
        let results = store.search_fts("attention", 1, &by_category).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.document_id, "language");

        let by_date = SearchFilter {
            published_after: NaiveDate::from_ymd_opt(2023, 12, 1),
            ..Default::default()
        };
        let results = store.search_fts("attention", 10, &by_date).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|(c, _)| c.document_id == "vision"));

        let both = SearchFilter {
            categories: vec!["cs.CL".to_string()],
            published_after: NaiveDate::from_ymd_opt(2023, 12, 1),
        };
        assert!(store.search_fts("attention", 10, &both).unwrap().is_empty());
    }

    #[test]
    fn test_delete_chunks_by_id() {
        let (_dir, store) = create_test_store();
        let chunks = vec![chunk("p1", 0, "alpha"), chunk("p1", 1, "beta")];
        store.upsert_chunks(&chunks).unwrap();

        assert_eq!(store.delete_chunks(&[chunks[0].id.clone()]).unwrap(), 1);
        assert_eq!(store.count_for_document("p1").unwrap(), 1);
        assert!(store.search_fts("alpha", 10, &SearchFilter::default()).unwrap().is_empty());
        assert_eq!(store.delete_chunks(&[]).unwrap(), 0);
    }

    #[test]
    fn test_delete_and_stats() {
        let (_dir, store) = create_test_store();
        store
            .upsert_chunks(&[
                chunk("p1", 0, "1234567890"),
                chunk("p1", 1, "abc"),
                chunk("p2", 0, "xyz"),
            ])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.total_content_bytes, 16);

        assert_eq!(store.delete_by_document("p1").unwrap(), 2);
        assert_eq!(store.count_for_document("p1").unwrap(), 0);
        assert!(store.search_fts("abc", 10, &SearchFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_escape_fts5_query() {
        assert_eq!(escape_fts5_query("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(escape_fts5_query("  "), "");
        assert_eq!(escape_fts5_query("hello:world"), "\"helloworld\"");
        assert_eq!(escape_fts5_query("test-query_123"), "\"test-query_123\"");
        assert_eq!(escape_fts5_query("NOT AND"), "\"NOT\" OR \"AND\"");
    }
}
