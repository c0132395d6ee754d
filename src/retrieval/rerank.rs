//! Cross-encoder reranking with a fused-rank fallback
//!
//! Candidates are scored in batches against the query; logits are mapped
//! through a sigmoid into (0, 1). Any scoring failure falls back to the
//! hybrid order so a query never fails because the reranker is down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{RagError, Result};
use crate::knowledge::hybrid::SearchResult;
use crate::retry::{RetryConfig, RetryPolicy};

const SERVICE: &str = "rerank";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// Base URL of a text-embeddings-inference style server
    pub url: String,
    pub model: String,
    pub top_n: usize,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub retry: RetryConfig,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            model: "BAAI/bge-reranker-base".to_string(),
            top_n: 5,
            batch_size: 16,
            max_in_flight: 2,
            retry: RetryConfig::default(),
        }
    }
}

// ============================================================================
// RerankClient Trait
// ============================================================================

/// Cross-encoder client returning raw relevance logits
#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn score(&self, query: &str, passage: &str) -> Result<f64>;

    /// One logit per passage, in input order (default: sequential calls)
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(passages.len());
        for passage in passages {
            scores.push(self.score(query, passage).await?);
        }
        Ok(scores)
    }

    fn name(&self) -> &str;
}

// ============================================================================
// HttpReranker
// ============================================================================

/// `POST /rerank` client (text-embeddings-inference API)
/// source: https://huggingface.github.io/text-embeddings-inference/#/Text%20Embeddings%20Inference/rerank
pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Debug, Deserialize)]
struct RankedText {
    index: usize,
    score: f64,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.retry.timeout_ms))
            .build()
            .map_err(|e| RagError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/rerank", config.url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

/// Put `[{index, score}]` back into input order
fn scores_in_order(ranked: Vec<RankedText>, expected: usize) -> Result<Vec<f64>> {
    let mut scores = vec![None; expected];
    for item in ranked {
        if let Some(slot) = scores.get_mut(item.index) {
            *slot = Some(item.score);
        }
    }
    let actual = scores.iter().filter(|s| s.is_some()).count();
    scores
        .into_iter()
        .collect::<Option<Vec<f64>>>()
        .ok_or(RagError::Upstream {
            service: SERVICE,
            status: 200,
            message: format!("expected {} scores, got {}", expected, actual),
        })
}

#[async_trait]
impl RerankClient for HttpReranker {
    async fn score(&self, query: &str, passage: &str) -> Result<f64> {
        let scores = self.score_batch(query, &[passage.to_string()]).await?;
        scores.first().copied().ok_or(RagError::Upstream {
            service: SERVICE,
            status: 200,
            message: "empty rerank response".to_string(),
        })
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let request = RerankRequest {
            query,
            texts: passages,
            raw_scores: true,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::from_http(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::from_status(SERVICE, status, body));
        }

        let ranked: Vec<RankedText> = response
            .json()
            .await
            .map_err(|e| RagError::from_http(SERVICE, e))?;
        scores_in_order(ranked, passages.len())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Reranker
// ============================================================================

/// Where a rerank score came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankSource {
    Model,
    /// Synthetic `1 / (1 + fused_rank)` after a scoring failure
    FusedRank,
}

#[derive(Debug, Clone)]
pub struct RerankedResult {
    pub result: SearchResult,
    /// In (0, 1)
    pub rerank_score: f64,
    /// 0-based position in the hybrid ranking
    pub fused_rank: usize,
    pub source: RerankSource,
}

pub struct Reranker {
    client: Arc<dyn RerankClient>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    batch_size: usize,
}

impl Reranker {
    pub fn new(client: Arc<dyn RerankClient>, config: &RerankConfig) -> Self {
        Self {
            client,
            policy: config.retry.policy(),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Rescore `candidates` (in fused order) and keep the best `top_n`
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        top_n: usize,
    ) -> Vec<RerankedResult> {
        if candidates.is_empty() || top_n == 0 {
            return vec![];
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();

        let mut reranked = match self.score_all(query, &passages).await {
            Ok(logits) => candidates
                .into_iter()
                .zip(logits)
                .enumerate()
                .map(|(rank, (result, logit))| RerankedResult {
                    result,
                    rerank_score: sigmoid(logit),
                    fused_rank: rank,
                    source: RerankSource::Model,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!("Reranking failed, keeping hybrid order: {}", e);
                return fallback(candidates, top_n);
            }
        };

        reranked.sort_by(|a, b| {
            b.rerank_score
                .total_cmp(&a.rerank_score)
                .then_with(|| a.fused_rank.cmp(&b.fused_rank))
        });
        reranked.truncate(top_n);

        tracing::debug!("Reranked {} -> {} results", passages.len(), reranked.len());
        reranked
    }

    async fn score_all(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let batches = passages
            .chunks(self.batch_size)
            .map(|batch| self.score_one_batch(query, batch));
        let scores: Vec<f64> = try_join_all(batches).await?.into_iter().flatten().collect();

        if scores.len() != passages.len() {
            return Err(RagError::Upstream {
                service: SERVICE,
                status: 200,
                message: format!("expected {} scores, got {}", passages.len(), scores.len()),
            });
        }
        Ok(scores)
    }

    async fn score_one_batch(&self, query: &str, batch: &[String]) -> Result<Vec<f64>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RagError::Internal(format!("rerank semaphore closed: {}", e)))?;

        let scores = self
            .policy
            .run("rerank", || self.client.score_batch(query, batch))
            .await?;

        if scores.len() != batch.len() {
            return Err(RagError::Upstream {
                service: SERVICE,
                status: 200,
                message: format!("expected {} scores, got {}", batch.len(), scores.len()),
            });
        }
        Ok(scores)
    }
}

fn sigmoid(logit: f64) -> f64 {
    1.0 / (1.0 + (-logit).exp())
}

fn fallback(candidates: Vec<SearchResult>, top_n: usize) -> Vec<RerankedResult> {
    candidates
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(rank, result)| RerankedResult {
            result,
            rerank_score: 1.0 / (1.0 + rank as f64),
            fused_rank: rank,
            source: RerankSource::FusedRank,
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{search_result, ScriptedReranker};
    use std::sync::atomic::Ordering;

    fn config(batch_size: usize) -> RerankConfig {
        RerankConfig {
            batch_size,
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                timeout_ms: 500,
            },
            ..Default::default()
        }
    }

    fn candidates() -> Vec<SearchResult> {
        vec![
            search_result("p1", 0, "unrelated preamble"),
            search_result("p1", 1, "the answer is attention"),
            search_result("p2", 0, "partially about attention"),
            search_result("p3", 0, "nothing"),
        ]
    }

    #[tokio::test]
    async fn test_rerank_orders_by_model_score() {
        let client = Arc::new(
            ScriptedReranker::new()
                .score_for("the answer is attention", 4.0)
                .score_for("partially about attention", 1.0),
        );
        let reranker = Reranker::new(client.clone(), &config(3));

        let out = reranker.rerank("attention?", candidates(), 2).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].result.chunk.content, "the answer is attention");
        assert_eq!(out[0].fused_rank, 1);
        assert_eq!(out[1].fused_rank, 2);
        assert!(out.iter().all(|r| r.source == RerankSource::Model));
        assert!(out.iter().all(|r| r.rerank_score > 0.0 && r.rerank_score < 1.0));
        // 4 passages in batches of 3
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rerank_length_is_min_of_top_n_and_candidates() {
        let reranker = Reranker::new(Arc::new(ScriptedReranker::new()), &config(16));
        assert_eq!(reranker.rerank("q", candidates(), 10).await.len(), 4);
        assert_eq!(reranker.rerank("q", candidates(), 1).await.len(), 1);
        assert!(reranker.rerank("q", vec![], 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_ties_keep_fused_order() {
        let reranker = Reranker::new(Arc::new(ScriptedReranker::new()), &config(16));
        let out = reranker.rerank("q", candidates(), 4).await;
        let ranks: Vec<usize> = out.iter().map(|r| r.fused_rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_fused_rank() {
        let client = Arc::new(ScriptedReranker::new().failing());
        let reranker = Reranker::new(client, &config(16));

        let out = reranker.rerank("q", candidates(), 3).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.source == RerankSource::FusedRank));
        assert_eq!(out[0].result.chunk.content, "unrelated preamble");
        assert_eq!(out[0].rerank_score, 1.0);
        assert_eq!(out[2].rerank_score, 1.0 / 3.0);
    }

    #[tokio::test]
    async fn test_short_score_list_falls_back() {
        let client = Arc::new(ScriptedReranker::new().dropping_last());
        let reranker = Reranker::new(client, &config(16));
        let out = reranker.rerank("q", candidates(), 2).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.source == RerankSource::FusedRank));
    }

    #[test]
    fn test_scores_in_order() {
        let ranked = vec![
            RankedText { index: 1, score: -2.0 },
            RankedText { index: 0, score: 3.5 },
        ];
        assert_eq!(scores_in_order(ranked, 2).unwrap(), vec![3.5, -2.0]);

        let partial = vec![RankedText { index: 0, score: 1.0 }];
        assert!(scores_in_order(partial, 2).is_err());
    }

    #[test]
    fn test_sigmoid_range() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(-5.0) > 0.0 && sigmoid(5.0) < 1.0);
    }
}
