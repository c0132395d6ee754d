//! Test fixtures and scripted model clients

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::llm::{Generation, GenerationClient};
use crate::knowledge::chunker::count_tokens;
use crate::knowledge::hybrid::{SearchMethod, SearchResult};
use crate::knowledge::index::{ChunkIndex, IndexStats, SearchFilter};
use crate::knowledge::memory::MemoryIndex;
use crate::knowledge::types::{
    Chunk, ChunkMetadata, ChunkType, Document, ParsingStatus, ScoredChunk,
};
use crate::retrieval::rerank::{RerankClient, RerankSource, RerankedResult};

// ============================================================================
// Fixtures
// ============================================================================

/// Body chunk with id `"{document_id}#{index}"`
pub fn chunk(document_id: &str, index: u32, content: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());

    Chunk {
        id: format!("{}#{}", document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        content: content.to_string(),
        section_title: None,
        chunk_type: ChunkType::Body,
        token_count: count_tokens(content),
        char_count: content.chars().count(),
        content_hash: format!("{:x}", hasher.finalize()),
        metadata: ChunkMetadata {
            arxiv_id: format!("arxiv-{}", document_id),
            title: format!("Paper {}", document_id),
            categories: vec![],
            published_date: None,
        },
    }
}

pub fn document(id: &str, text: &str) -> Document {
    Document {
        id: id.to_string(),
        arxiv_id: format!("arxiv-{}", id),
        title: format!("Paper {}", id),
        text: Some(text.to_string()),
        categories: vec!["cs.CL".to_string()],
        published_date: None,
        status: ParsingStatus::Parsed,
    }
}

pub fn search_result(document_id: &str, index: u32, content: &str) -> SearchResult {
    SearchResult {
        chunk: chunk(document_id, index, content),
        method: SearchMethod::Fused,
        score: 0.5,
        lexical_score: None,
        vector_score: None,
    }
}

pub fn reranked(document_id: &str, index: u32, content: &str, score: f64) -> RerankedResult {
    RerankedResult {
        result: search_result(document_id, index, content),
        rerank_score: score,
        fused_rank: index as usize,
        source: RerankSource::Model,
    }
}

// ============================================================================
// HashEmbedding
// ============================================================================

/// Deterministic embedding derived from a SHA-256 of the text
pub struct HashEmbedding {
    dimension: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    delay: Option<Duration>,
    drop_last: bool,
    failures_left: AtomicUsize,
    permanent_failure: AtomicBool,
    in_flight: AtomicUsize,
    /// Calls to `embed_batch`, failed ones included
    pub batch_calls: AtomicUsize,
    /// Highest number of concurrent `embed_batch` calls seen
    pub max_in_flight: AtomicUsize,
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: Mutex::new(HashMap::new()),
            delay: None,
            drop_last: false,
            failures_left: AtomicUsize::new(0),
            permanent_failure: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Return one vector fewer than requested
    pub fn dropping_last(mut self) -> Self {
        self.drop_last = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` batch calls with a transient error
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Reject every batch call with a non-retryable error
    pub fn fail_permanently(&self, fail: bool) {
        self.permanent_failure.store(fail, Ordering::SeqCst);
    }

    /// Pin the vector returned for `text`
    pub fn set_override(&self, text: &str, vector: Vec<f32>) {
        self.overrides
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut round = 0u32;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(round.to_le_bytes());
            hasher.update(text.as_bytes());
            for byte in hasher.finalize() {
                if vector.len() == self.dimension {
                    break;
                }
                vector.push(byte as f32 / 127.5 - 1.0);
            }
            round += 1;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let pinned = self.overrides.lock().unwrap().get(text).cloned();
        Ok(pinned.unwrap_or_else(|| self.hash_vector(text)))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.permanent_failure.load(Ordering::SeqCst) {
            return Err(RagError::Upstream {
                service: "embedding",
                status: 404,
                message: "model not found".to_string(),
            });
        }
        if self.take_failure() {
            return Err(RagError::TransientUpstream {
                service: "embedding",
                message: "connection reset".to_string(),
            });
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash-embedding"
    }
}

// ============================================================================
// ScriptedReranker
// ============================================================================

/// Returns a fixed logit per passage (0.0 unless scripted)
pub struct ScriptedReranker {
    logits: HashMap<String, f64>,
    failing: bool,
    drop_last: bool,
    /// Calls to `score_batch`
    pub calls: AtomicUsize,
}

impl ScriptedReranker {
    pub fn new() -> Self {
        Self {
            logits: HashMap::new(),
            failing: false,
            drop_last: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn score_for(mut self, passage: &str, logit: f64) -> Self {
        self.logits.insert(passage.to_string(), logit);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn dropping_last(mut self) -> Self {
        self.drop_last = true;
        self
    }
}

#[async_trait]
impl RerankClient for ScriptedReranker {
    async fn score(&self, _query: &str, passage: &str) -> Result<f64> {
        Ok(self.logits.get(passage).copied().unwrap_or(0.0))
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(RagError::TransientUpstream {
                service: "rerank",
                message: "service unavailable".to_string(),
            });
        }

        let mut scores = Vec::with_capacity(passages.len());
        for passage in passages {
            scores.push(self.score(query, passage).await?);
        }
        if self.drop_last {
            scores.pop();
        }
        Ok(scores)
    }

    fn name(&self) -> &str {
        "scripted-reranker"
    }
}

// ============================================================================
// FaultyIndex
// ============================================================================

/// In-memory index whose paths can be switched off
pub struct FaultyIndex {
    inner: MemoryIndex,
    lexical_down: AtomicBool,
    vector_down: AtomicBool,
}

impl FaultyIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: MemoryIndex::new(dimension),
            lexical_down: AtomicBool::new(false),
            vector_down: AtomicBool::new(false),
        }
    }

    pub fn set_lexical_down(&self, down: bool) {
        self.lexical_down.store(down, Ordering::SeqCst);
    }

    pub fn set_vector_down(&self, down: bool) {
        self.vector_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkIndex for FaultyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        self.inner.upsert(chunks, embeddings).await
    }

    async fn lexical_query(
        &self,
        text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        if self.lexical_down.load(Ordering::SeqCst) {
            return Err(RagError::lexical_index("database is locked"));
        }
        self.inner.lexical_query(text, k, filter).await
    }

    async fn vector_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        if self.vector_down.load(Ordering::SeqCst) {
            return Err(RagError::vector_index("table not found"));
        }
        self.inner.vector_query(embedding, k, filter).await
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_by_document(document_id).await
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        self.inner.count_for_document(document_id).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// ScriptedGenerator
// ============================================================================

/// Generation client with a canned reply
pub struct ScriptedGenerator {
    reply: String,
    delay: Option<Duration>,
    done: bool,
    prompts: Mutex<Vec<(String, String)>>,
    models: Mutex<Vec<Option<String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: None,
            done: true,
            prompts: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reply with `done: false`
    pub fn incomplete(mut self) -> Self {
        self.done = false;
        self
    }

    /// Recorded (system, prompt) pairs
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    /// Model requested by each call (`None` = default)
    pub fn models(&self) -> Vec<Option<String>> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    async fn generate(&self, system: &str, prompt: &str, model: Option<&str>) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), prompt.to_string()));
        self.models.lock().unwrap().push(model.map(str::to_string));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Generation {
            text: self.reply.clone(),
            done: self.done,
        })
    }

    fn model_name(&self) -> &str {
        "scripted-llm"
    }
}
