//! Hybrid search - lexical (BM25) + vector (cosine) with min-max fusion
//!
//! Both paths run concurrently and each fetches `oversample × top_k`
//! candidates. Scores are min-max normalized per path and combined as
//! `w_l·lexical + w_v·vector`; a chunk seen by one path only keeps that
//! path's normalized score. If one path fails the other is ranked alone
//! and the response carries a [`Degradation`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::{ErrorKind, RagError, Result};

use super::index::ChunkIndex;
use super::types::{Chunk, ScoredChunk};

pub use super::index::SearchFilter;

// ============================================================================
// Types
// ============================================================================

/// Which path(s) produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Lexical,
    Vector,
    /// Found by both paths
    Fused,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Lexical => "lexical",
            SearchMethod::Vector => "vector",
            SearchMethod::Fused => "fused",
        }
    }
}

/// Search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub method: SearchMethod,
    /// Fused score in [0, 1]
    pub score: f64,
    /// Raw BM25 score, when the lexical path found this chunk
    pub lexical_score: Option<f64>,
    /// Raw cosine similarity, when the vector path found this chunk
    pub vector_score: Option<f64>,
}

/// A retrieval path that failed while the other survived
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degradation {
    pub path: SearchMethod,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub degradation: Option<Degradation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates per path = oversample × top_k
    pub oversample: usize,
    pub lexical_weight: f64,
    pub vector_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            oversample: 3,
            lexical_weight: 0.5,
            vector_weight: 0.5,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.oversample == 0 {
            return Err(RagError::InvalidConfig(
                "search.oversample must be > 0".to_string(),
            ));
        }
        let weights = [self.lexical_weight, self.vector_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(RagError::InvalidConfig(format!(
                "search weights must be non-negative with a positive sum (lexical {}, vector {})",
                self.lexical_weight, self.vector_weight
            )));
        }
        Ok(())
    }

    /// Weights scaled to sum to 1
    fn normalized_weights(&self) -> (f64, f64) {
        let sum = self.lexical_weight + self.vector_weight;
        if sum > 0.0 {
            (self.lexical_weight / sum, self.vector_weight / sum)
        } else {
            (0.5, 0.5)
        }
    }
}

// ============================================================================
// HybridSearchEngine
// ============================================================================

pub struct HybridSearchEngine {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<Embedder>,
    config: SearchConfig,
}

impl HybridSearchEngine {
    pub fn new(index: Arc<dyn ChunkIndex>, embedder: Arc<Embedder>, config: SearchConfig) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Hybrid search; at most `top_k` results, best first
    pub async fn search(&self, query: &str, top_k: usize) -> Result<SearchResponse> {
        self.search_filtered(query, top_k, &SearchFilter::default())
            .await
    }

    /// Hybrid search restricted to chunks matching `filter`.
    ///
    /// The filter is pushed into both index paths, so a selective filter
    /// still yields up to `top_k` results.
    pub async fn search_filtered(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResponse> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(SearchResponse::default());
        }

        let fetch = top_k.saturating_mul(self.config.oversample.max(1));

        let lexical = self.index.lexical_query(query, fetch, filter);
        let vector = async {
            let embedding = self.embedder.embed(query).await?;
            self.index.vector_query(&embedding, fetch, filter).await
        };
        let (lexical, vector) = tokio::join!(lexical, vector);

        let (lexical, vector, degradation) = match (lexical, vector) {
            // A dimension mismatch is a deployment fault, not a path outage
            (Err(e), _) if e.kind() == ErrorKind::ConfigurationMismatch => return Err(e),
            (_, Err(e)) if e.kind() == ErrorKind::ConfigurationMismatch => return Err(e),
            (Ok(l), Ok(v)) => (l, v, None),
            (Ok(l), Err(e)) => {
                tracing::warn!("Vector path failed, ranking lexical results only: {}", e);
                (l, vec![], Some(degraded(SearchMethod::Vector, &e)))
            }
            (Err(e), Ok(v)) => {
                tracing::warn!("Lexical path failed, ranking vector results only: {}", e);
                (vec![], v, Some(degraded(SearchMethod::Lexical, &e)))
            }
            (Err(le), Err(ve)) => {
                return Err(RagError::IndexUnavailable {
                    path: "lexical+vector",
                    reason: format!("lexical: {}; vector: {}", le, ve),
                });
            }
        };

        let (lexical_hits, vector_hits) = (lexical.len(), vector.len());
        let results = fuse(lexical, vector, &self.config, top_k);

        tracing::debug!(
            "Search '{}': {} lexical + {} vector candidates -> {} results",
            query,
            lexical_hits,
            vector_hits,
            results.len()
        );

        Ok(SearchResponse {
            results,
            degradation,
        })
    }
}

fn degraded(path: SearchMethod, error: &RagError) -> Degradation {
    Degradation {
        path,
        reason: error.to_string(),
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// Min-max normalize scores; a constant (or single) list maps to 1.0
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let (min, max) = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));

    let range = max - min;
    scores
        .iter()
        .map(|&s| {
            if range.abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / range
            }
        })
        .collect()
}

#[derive(Default)]
struct Candidate {
    chunk: Option<Chunk>,
    lexical_raw: Option<f64>,
    lexical_norm: Option<f64>,
    vector_raw: Option<f64>,
    vector_norm: Option<f64>,
}

/// Fuse per-path candidates into at most `top_k` ranked results.
///
/// Order: fused score desc, normalized lexical desc, chunk ordinal asc,
/// then document id and chunk id.
pub fn fuse(
    lexical: Vec<ScoredChunk>,
    vector: Vec<ScoredChunk>,
    config: &SearchConfig,
    top_k: usize,
) -> Vec<SearchResult> {
    let (w_lexical, w_vector) = config.normalized_weights();
    let lexical_norm = min_max_normalize(&lexical.iter().map(|s| s.score).collect::<Vec<_>>());
    let vector_norm = min_max_normalize(&vector.iter().map(|s| s.score).collect::<Vec<_>>());

    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (hit, norm) in lexical.into_iter().zip(lexical_norm) {
        let entry = candidates.entry(hit.chunk.id.clone()).or_default();
        if entry.lexical_norm.map_or(true, |n| norm > n) {
            entry.lexical_raw = Some(hit.score);
            entry.lexical_norm = Some(norm);
        }
        entry.chunk.get_or_insert(hit.chunk);
    }

    for (hit, norm) in vector.into_iter().zip(vector_norm) {
        let entry = candidates.entry(hit.chunk.id.clone()).or_default();
        if entry.vector_norm.map_or(true, |n| norm > n) {
            entry.vector_raw = Some(hit.score);
            entry.vector_norm = Some(norm);
        }
        entry.chunk.get_or_insert(hit.chunk);
    }

    let mut results: Vec<(SearchResult, f64)> = candidates
        .into_values()
        .filter_map(|c| {
            let chunk = c.chunk?;
            let (method, score) = match (c.lexical_norm, c.vector_norm) {
                (Some(l), Some(v)) => (SearchMethod::Fused, w_lexical * l + w_vector * v),
                (Some(l), None) => (SearchMethod::Lexical, l),
                (None, Some(v)) => (SearchMethod::Vector, v),
                (None, None) => return None,
            };
            let tie = c.lexical_norm.unwrap_or(-1.0);
            Some((
                SearchResult {
                    chunk,
                    method,
                    score: score.clamp(0.0, 1.0),
                    lexical_score: c.lexical_raw,
                    vector_score: c.vector_raw,
                },
                tie,
            ))
        })
        .collect();

    results.sort_by(|(a, a_lex), (b, b_lex)| compare_results(a, *a_lex, b, *b_lex));
    results.truncate(top_k);
    results.into_iter().map(|(r, _)| r).collect()
}

fn compare_results(a: &SearchResult, a_lex: f64, b: &SearchResult, b_lex: f64) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b_lex.total_cmp(&a_lex))
        .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

// ============================================================================
// Tests
// ============================================================================
