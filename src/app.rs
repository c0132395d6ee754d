//! Application wiring - one handle over indexing, search and answering

use std::sync::Arc;

use crate::config::RagConfig;
use crate::embedding::{Embedder, EmbeddingProvider, OllamaEmbedding};
use crate::error::{RagError, Result};
use crate::generation::answer::{AnswerGenerator, AnswerOptions, AnswerResult, AskError};
use crate::generation::llm::{GenerationClient, OllamaGenerator};
use crate::knowledge::chunker::semantic_chunker;
use crate::knowledge::hybrid::{HybridSearchEngine, SearchFilter, SearchResponse};
use crate::knowledge::index::{ChunkIndex, IndexStats};
use crate::knowledge::indexer::{IndexReport, Indexer};
use crate::knowledge::local::LocalIndex;
use crate::knowledge::types::Document;
use crate::retrieval::context::ContextAssembler;
use crate::retrieval::rerank::{HttpReranker, RerankClient, Reranker};

/// Model clients the pipeline talks to
pub struct Clients {
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub rerank: Arc<dyn RerankClient>,
    pub generation: Arc<dyn GenerationClient>,
}

impl Clients {
    /// Ollama embedding/generation and an HTTP cross-encoder
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Ok(Self {
            embedding: Arc::new(OllamaEmbedding::new(&config.embedding)?),
            rerank: Arc::new(HttpReranker::new(&config.rerank)?),
            generation: Arc::new(OllamaGenerator::new(&config.generation)?),
        })
    }
}

pub struct RagApp {
    config: RagConfig,
    index: Arc<dyn ChunkIndex>,
    indexer: Indexer,
    search: Arc<HybridSearchEngine>,
    answers: AnswerGenerator,
}

impl RagApp {
    /// On-disk index under `config.data_dir` with HTTP model clients
    pub async fn open(config: RagConfig) -> Result<Self> {
        let index = LocalIndex::open(&config.data_dir, config.embedding.dimension).await?;
        let clients = Clients::from_config(&config)?;
        Self::from_parts(config, Arc::new(index), clients)
    }

    pub fn from_parts(config: RagConfig, index: Arc<dyn ChunkIndex>, clients: Clients) -> Result<Self> {
        config.validate()?;

        let embedder = Arc::new(Embedder::new(clients.embedding, &config.embedding));
        if index.dimension() != embedder.dimension() {
            return Err(RagError::ConfigurationMismatch {
                context: "index dimension".to_string(),
                expected: embedder.dimension(),
                actual: index.dimension(),
            });
        }
        tracing::debug!(
            "Pipeline ready: embedding model {} ({} dims)",
            embedder.model_name(),
            embedder.dimension()
        );

        let indexer = Indexer::new(
            index.clone(),
            embedder.clone(),
            semantic_chunker(config.chunking.clone())?,
        );
        let search = Arc::new(HybridSearchEngine::new(
            index.clone(),
            embedder,
            config.search.clone(),
        ));
        let reranker = Arc::new(Reranker::new(clients.rerank, &config.rerank));
        let answers = AnswerGenerator::new(
            search.clone(),
            reranker,
            ContextAssembler::new(config.context.clone()),
            clients.generation,
            AnswerOptions {
                rerank_top_n: config.rerank.top_n,
                generation_policy: config.generation.retry.policy(),
                request_timeout: config.request_timeout(),
            },
        );

        Ok(Self {
            config,
            index,
            indexer,
            search,
            answers,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub async fn index_document(&self, document: &Document) -> Result<IndexReport> {
        self.indexer.index(document).await
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.indexer.remove(document_id).await
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResponse> {
        self.search.search_filtered(query, top_k, filter).await
    }

    /// `model` overrides `generation.model` for this question only
    pub async fn ask(
        &self,
        question: &str,
        top_k: usize,
        filter: &SearchFilter,
        model: Option<&str>,
    ) -> std::result::Result<AnswerResult, AskError> {
        self.answers
            .ask_filtered(question, top_k, filter, model)
            .await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.index.stats().await
    }
}
