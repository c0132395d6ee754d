//! In-memory [`ChunkIndex`] for tests and small corpora.
//!
//! Chunks and vectors live in a `HashMap` behind `std::sync::RwLock`.
//! Lexical search is BM25 computed at query time; vector search is
//! brute-force cosine similarity.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{RagError, Result};

use super::index::{check_dimension, check_upsert, ChunkIndex, IndexStats, SearchFilter};
use super::types::{Chunk, ScoredChunk};
use super::vector::cosine_similarity;

/// BM25 term-frequency saturation
const BM25_K1: f64 = 1.2;
/// BM25 length normalization
const BM25_B: f64 = 0.75;

struct StoredChunk {
    chunk: Chunk,
    terms: Vec<String>,
    embedding: Vec<f32>,
}

pub struct MemoryIndex {
    dimension: usize,
    chunks: RwLock<HashMap<String, StoredChunk>>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> RagError {
        RagError::Internal(format!("Lock error: {}", e))
    }
}

#[async_trait]
impl ChunkIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        check_upsert(self.dimension, chunks, embeddings)?;

        let mut map = self.chunks.write().map_err(Self::lock_err)?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            map.insert(
                chunk.id.clone(),
                StoredChunk {
                    chunk: chunk.clone(),
                    terms: tokenize(&chunk.content),
                    embedding: embedding.clone(),
                },
            );
        }
        Ok(chunks.len())
    }

    async fn lexical_query(
        &self,
        text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let query_terms: HashSet<String> = tokenize(text).into_iter().collect();
        if query_terms.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let map = self.chunks.read().map_err(Self::lock_err)?;
        if map.is_empty() {
            return Ok(vec![]);
        }

        let n = map.len() as f64;
        let avg_len = map.values().map(|s| s.terms.len()).sum::<usize>() as f64 / n;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for stored in map.values() {
            let unique: HashSet<&str> = stored.terms.iter().map(String::as_str).collect();
            for term in &query_terms {
                if unique.contains(term.as_str()) {
                    *doc_freq.entry(term.as_str()).or_insert(0) += 1;
                }
            }
        }

        // Corpus statistics cover every chunk; the filter only limits candidates
        let mut scored: Vec<ScoredChunk> = map
            .values()
            .filter(|stored| filter.matches(&stored.chunk))
            .filter_map(|stored| {
                let len = stored.terms.len() as f64;
                let mut score = 0.0;
                for term in &query_terms {
                    let Some(&df) = doc_freq.get(term.as_str()) else {
                        continue;
                    };
                    let tf = stored.terms.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let idf = ((n - df as f64 + 0.5) / (df as f64 + 0.5) + 1.0).ln();
                    let norm = 1.0 - BM25_B + BM25_B * len / avg_len.max(1.0);
                    score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                }
                (score > 0.0).then(|| ScoredChunk {
                    chunk: stored.chunk.clone(),
                    score,
                })
            })
            .collect();

        sort_scored(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn vector_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        check_dimension(self.dimension, embedding, "vector query")?;

        let map = self.chunks.read().map_err(Self::lock_err)?;
        let mut scored: Vec<ScoredChunk> = map
            .values()
            .filter(|stored| filter.matches(&stored.chunk))
            .map(|stored| ScoredChunk {
                chunk: stored.chunk.clone(),
                score: cosine_similarity(embedding, &stored.embedding) as f64,
            })
            .collect();

        sort_scored(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut map = self.chunks.write().map_err(Self::lock_err)?;
        let before = map.len();
        map.retain(|_, stored| stored.chunk.document_id != document_id);
        Ok(before - map.len())
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let map = self.chunks.read().map_err(Self::lock_err)?;
        Ok(map
            .values()
            .filter(|s| s.chunk.document_id == document_id)
            .count())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let map = self.chunks.read().map_err(Self::lock_err)?;
        let documents: HashSet<&str> = map.values().map(|s| s.chunk.document_id.as_str()).collect();
        Ok(IndexStats {
            chunk_count: map.len(),
            document_count: documents.len(),
            vector_count: map.len(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Lowercased alphanumeric terms
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Score desc, then (document, ordinal) for a stable order
fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
}

// ============================================================================
// Tests
// ============================================================================
