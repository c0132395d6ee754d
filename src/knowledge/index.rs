//! Chunk index interface shared by the in-memory and on-disk backends

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{RagError, Result};

use super::types::{Chunk, ScoredChunk};

// ============================================================================
// ChunkIndex Trait
// ============================================================================

/// Lexical + vector index over chunks.
///
/// Lexical scores are BM25-style (higher is better, unbounded); vector
/// scores are cosine similarities. Both paths return at most `k` results
/// matching `filter`, best first; the filter is applied before the top-k
/// cut.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Embedding dimension every stored and queried vector must have
    fn dimension(&self) -> usize;

    /// Insert or replace chunks (by chunk id) with their embeddings
    async fn upsert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize>;

    async fn lexical_query(
        &self,
        text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>>;

    async fn vector_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove every chunk of a document; returns the number removed
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    async fn count_for_document(&self, document_id: &str) -> Result<usize>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// Metadata restriction on both retrieval paths
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Keep chunks tagged with any of these arXiv categories (empty = all)
    pub categories: Vec<String>,
    /// Keep chunks of papers published on or after this date
    pub published_after: Option<NaiveDate>,
}

impl SearchFilter {
    /// Papers from the last `days` days, relative to `today`
    pub fn recent(days: u32, today: NaiveDate) -> Self {
        Self {
            categories: vec![],
            published_after: today.checked_sub_days(chrono::Days::new(days as u64)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.published_after.is_none()
    }

    /// A chunk without a publication date never passes a date bound
    pub fn matches(&self, chunk: &Chunk) -> bool {
        let category_ok = self.categories.is_empty()
            || chunk
                .metadata
                .categories
                .iter()
                .any(|c| self.categories.contains(c));
        let date_ok = match self.published_after {
            None => true,
            Some(after) => chunk.metadata.published_date.is_some_and(|d| d >= after),
        };
        category_ok && date_ok
    }
}

/// Index totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub document_count: usize,
    pub vector_count: usize,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Reject a vector whose length differs from the index dimension
pub fn check_dimension(expected: usize, embedding: &[f32], context: &str) -> Result<()> {
    if embedding.len() != expected {
        return Err(RagError::ConfigurationMismatch {
            context: context.to_string(),
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

/// Validate an upsert batch: one embedding per chunk, all of the right size
pub fn check_upsert(dimension: usize, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
    if chunks.len() != embeddings.len() {
        return Err(RagError::EmbeddingBatchMismatch {
            expected: chunks.len(),
            actual: embeddings.len(),
        });
    }
    for embedding in embeddings {
        check_dimension(dimension, embedding, "upsert")?;
    }
    Ok(())
}
