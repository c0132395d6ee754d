//! Vector Store - trait and similarity helpers for the embedding side
//! of the index

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;

use super::index::SearchFilter;

/// Default embedding dimension (nomic-embed-text)
/// source: https://ollama.com/library/nomic-embed-text
pub const EMBEDDING_DIMENSION: usize = 768;

// ============================================================================
// Types
// ============================================================================

/// Vector row to store
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub document_id: String,
    /// Chunk ordinal within its document
    pub chunk_index: i32,
    /// Copied from the chunk so searches can filter without a join
    pub categories: Vec<String>,
    pub published_date: Option<NaiveDate>,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbour hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i32,
    /// Cosine similarity (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Common interface of vector backends
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embedding dimension the store was opened with
    fn dimension(&self) -> usize;

    /// Insert (or replace, by chunk id) a batch of vectors
    async fn insert_batch(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// Top-`limit` rows matching `filter` by cosine similarity
    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>>;

    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    async fn count_for_document(&self, document_id: &str) -> Result<usize>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Cosine similarity (-1.0 ~ 1.0); 0.0 for empty, mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Quote a string literal for a Lance SQL filter
pub(crate) fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ============================================================================
// Tests
// ============================================================================
