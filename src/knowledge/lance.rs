//! LanceDB Vector Store - ANN search over chunk embeddings
//!
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use crate::error::{RagError, Result};

use super::index::SearchFilter;
use super::vector::{sql_quote, VectorEntry, VectorHit, VectorStore};

/// Vector table name
const TABLE_NAME: &str = "chunk_vectors";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB vector store
///
/// Rows are keyed by chunk id; text lives in the chunk store.
pub struct LanceVectorStore {
    db: Connection,
    dimension: usize,
}

impl LanceVectorStore {
    /// Open the store at `path` (a .lance directory).
    ///
    /// An existing table built with another dimension is rejected with
    /// [`RagError::ConfigurationMismatch`].
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    RagError::vector_index(format!("Failed to create LanceDB directory: {}", e))
                })?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| RagError::vector_index("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .map_err(|e| RagError::vector_index(format!("Failed to connect to LanceDB: {}", e)))?;

        let store = Self { db, dimension };
        store.check_existing_dimension().await?;
        Ok(store)
    }

    async fn check_existing_dimension(&self) -> Result<()> {
        if !self.table_exists().await {
            return Ok(());
        }

        let schema = self
            .open_table()
            .await?
            .schema()
            .await
            .map_err(RagError::vector_index)?;

        let stored = schema
            .field_with_name("embedding")
            .ok()
            .and_then(|f| match f.data_type() {
                DataType::FixedSizeList(_, n) => Some(*n as usize),
                _ => None,
            });

        match stored {
            Some(n) if n != self.dimension => Err(RagError::ConfigurationMismatch {
                context: format!("existing vector table {}", TABLE_NAME),
                expected: self.dimension,
                actual: n,
            }),
            Some(_) => Ok(()),
            None => Err(RagError::vector_index("Missing embedding column")),
        }
    }

    fn create_schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("categories", DataType::Utf8, false),
            Field::new("published_date", DataType::Utf8, true),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// Convert entries to an Arrow RecordBatch
    fn entries_to_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            return Err(RagError::Internal(
                "Cannot create batch from empty entries".to_string(),
            ));
        }

        let chunk_ids: Vec<&str> = entries.iter().map(|e| e.chunk_id.as_str()).collect();
        let document_ids: Vec<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();
        let chunk_indices: Vec<i32> = entries.iter().map(|e| e.chunk_index).collect();
        let categories: Vec<String> = entries
            .iter()
            .map(|e| encode_categories(&e.categories))
            .collect();
        let published: Vec<Option<String>> = entries
            .iter()
            .map(|e| e.published_date.map(|d| d.to_string()))
            .collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .map_err(|e| RagError::vector_index(format!("Failed to create embedding array: {}", e)))?;

        RecordBatch::try_new(
            Arc::new(self.create_schema()),
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(document_ids)),
                Arc::new(Int32Array::from(chunk_indices)),
                Arc::new(StringArray::from(categories)),
                Arc::new(StringArray::from(published)),
                Arc::new(embeddings_list),
            ],
        )
        .map_err(|e| RagError::vector_index(format!("Failed to create RecordBatch: {}", e)))
    }

    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == TABLE_NAME))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::vector_index(format!("Failed to open table: {}", e)))
    }

    /// Delete rows matching a Lance SQL filter; returns rows removed
    async fn delete_where(&self, filter: &str) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }
        let table = self.open_table().await?;

        let before = table
            .count_rows(Some(filter.to_string()))
            .await
            .map_err(RagError::vector_index)?;
        if before == 0 {
            return Ok(0);
        }

        table
            .delete(filter)
            .await
            .map_err(|e| RagError::vector_index(format!("Failed to delete vectors: {}", e)))?;
        Ok(before)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = self.entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if self.table_exists().await {
            // Replace rows that share a chunk id
            let ids = entries
                .iter()
                .map(|e| sql_quote(&e.chunk_id))
                .collect::<Vec<_>>()
                .join(", ");
            self.delete_where(&format!("chunk_id IN ({})", ids)).await?;

            self.open_table()
                .await?
                .add(batches)
                .execute()
                .await
                .map_err(|e| RagError::vector_index(format!("Failed to add vectors: {}", e)))?;
        } else {
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| RagError::vector_index(format!("Failed to create table: {}", e)))?;
        }

        Ok(entries.len())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>> {
        if !self.table_exists().await || limit == 0 {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;

        let mut query = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e| RagError::vector_index(format!("Failed to create vector search: {}", e)))?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        // Prefiltered, so the limit counts matching rows only
        if let Some(predicate) = filter_predicate(filter) {
            query = query.only_if(predicate);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| RagError::vector_index(format!("Failed to execute vector search: {}", e)))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(RagError::vector_index)?;

        let mut hits = Vec::new();
        for batch in batches {
            let chunk_ids = string_column(&batch, "chunk_id")?;
            let document_ids = string_column(&batch, "document_id")?;
            let chunk_indices = batch
                .column_by_name("chunk_index")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
                .ok_or_else(|| RagError::vector_index("Missing chunk_index column"))?;

            // _distance is added by LanceDB; cosine distance is 1 - similarity
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RagError::vector_index("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                hits.push(VectorHit {
                    chunk_id: chunk_ids.value(i).to_string(),
                    document_id: document_ids.value(i).to_string(),
                    chunk_index: chunk_indices.value(i),
                    similarity: 1.0 - distances.value(i),
                });
            }
        }

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.delete_where(&format!("document_id = {}", sql_quote(document_id)))
            .await
    }

    async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }
        self.open_table()
            .await?
            .count_rows(None)
            .await
            .map_err(RagError::vector_index)
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }
        self.open_table()
            .await?
            .count_rows(Some(format!("document_id = {}", sql_quote(document_id))))
            .await
            .map_err(RagError::vector_index)
    }
}

/// Categories as `|a|b|`, so one category is a `LIKE '%|a|%'` match
fn encode_categories(categories: &[String]) -> String {
    if categories.is_empty() {
        return String::new();
    }
    format!("|{}|", categories.join("|"))
}

/// Lance SQL predicate for `filter`, or `None` when it keeps everything
/// source: https://lancedb.github.io/lancedb/sql/
fn filter_predicate(filter: &SearchFilter) -> Option<String> {
    let mut clauses = Vec::new();

    let categories: Vec<String> = filter
        .categories
        .iter()
        .map(|c| {
            // LIKE wildcards and the delimiter cannot appear in a category
            let clean: String = c.chars().filter(|ch| !matches!(ch, '%' | '_' | '|')).collect();
            format!("categories LIKE {}", sql_quote(&format!("%|{}|%", clean)))
        })
        .collect();
    if !categories.is_empty() {
        clauses.push(format!("({})", categories.join(" OR ")));
    }

    if let Some(after) = filter.published_after {
        clauses.push(format!(
            "published_date IS NOT NULL AND published_date >= {}",
            sql_quote(&after.to_string())
        ));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| RagError::vector_index(format!("Missing {} column", name)))
}

// ============================================================================
// Tests
// ============================================================================
