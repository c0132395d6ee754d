//! Embedding module - text vectorization through a local Ollama model
//!
//! [`EmbeddingProvider`] is the raw model client; [`Embedder`] wraps one
//! with batching, bounded concurrency, retry and dimension checks.
//!
//! ## Usage
//! ```rust,ignore
//! let provider = OllamaEmbedding::new(&config.embedding)?;
//! let embedder = Embedder::new(Arc::new(provider), &config.embedding);
//! let vector = embedder.embed("sparse attention").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{RagError, Result};
use crate::knowledge::index::check_dimension;
use crate::knowledge::EMBEDDING_DIMENSION;
use crate::retry::{RetryConfig, RetryPolicy};

const SERVICE: &str = "embedding";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Ollama base URL
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    /// Texts per provider call
    pub batch_size: usize,
    /// Concurrent provider calls
    pub max_in_flight: usize,
    pub retry: RetryConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: EMBEDDING_DIMENSION,
            batch_size: 32,
            max_in_flight: 4,
            retry: RetryConfig::default(),
        }
    }
}

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Embedding model client
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch (default: sequential calls)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// Ollama `/api/embed` client
/// source: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings
#[derive(Debug)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedding {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.retry.timeout_ms))
            .build()
            .map_err(|e| RagError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or(RagError::EmbeddingBatchMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
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

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::from_http(SERVICE, e))?;
        Ok(body.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Provider wrapper used by indexing and search
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    dimension: usize,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            policy: config.retry.policy(),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or(RagError::EmbeddingBatchMismatch {
            expected: 1,
            actual: 0,
        })
    }

    /// Embed many texts; output order mirrors input order
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batches = texts.chunks(self.batch_size);
        tracing::debug!(
            "Embedding {} texts in {} batches via {}",
            texts.len(),
            batches.len(),
            self.provider.name()
        );

        let results = try_join_all(batches.map(|batch| self.embed_one_batch(batch))).await?;
        Ok(results.into_iter().flatten().collect())
    }

    async fn embed_one_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RagError::Internal(format!("embedding semaphore closed: {}", e)))?;

        let vectors = self
            .policy
            .run("embedding", || self.provider.embed_batch(batch))
            .await?;

        if vectors.len() != batch.len() {
            return Err(RagError::EmbeddingBatchMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            });
        }
        for vector in &vectors {
            check_dimension(self.dimension, vector, "embedding response")?;
        }
        Ok(vectors)
    }
}

// ============================================================================
// Tests
// ============================================================================
