//! Answer generation - search → rerank → assemble → generate
//!
//! Each request runs under one deadline. Stages are logged as they are
//! entered; a failure reports the stage it happened in together with the
//! retrieval timing recorded so far.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::error::{ErrorKind, RagError};
use crate::knowledge::hybrid::{HybridSearchEngine, SearchFilter};
use crate::retrieval::context::{Citation, ContextAssembler};
use crate::retrieval::rerank::{RerankSource, Reranker};
use crate::retry::RetryPolicy;

use super::llm::GenerationClient;
use super::prompt::{format_prompt, INSUFFICIENT_CONTEXT_ANSWER, SYSTEM_PROMPT};

// ============================================================================
// Types
// ============================================================================

/// Pipeline stage of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Retrieving,
    Reranking,
    Assembling,
    Generating,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Retrieving => "retrieving",
            Stage::Reranking => "reranking",
            Stage::Assembling => "assembling",
            Stage::Generating => "generating",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    /// Nothing survived retrieval; the model was not called
    InsufficientContext,
}

/// A stage that fell back instead of failing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedStage {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub answer: String,
    pub status: AnswerStatus,
    pub sources: Vec<Citation>,
    pub model: String,
    /// Search + rerank + assembly
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
    pub degradations: Vec<DegradedStage>,
}

/// Failed `ask`: what broke, where, and the timing recorded so far
#[derive(Debug, Error)]
#[error("ask failed while {stage}: {error}")]
pub struct AskError {
    pub stage: Stage,
    #[source]
    pub error: RagError,
    /// Present once retrieval completed
    pub retrieval_ms: Option<u64>,
    pub total_ms: u64,
}

impl AskError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn report(&self) -> AskFailure {
        AskFailure {
            stage: self.stage,
            kind: self.kind(),
            reason: self.error.to_string(),
            retrieval_ms: self.retrieval_ms,
            total_ms: self.total_ms,
        }
    }
}

/// Serializable form of an [`AskError`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub reason: String,
    pub retrieval_ms: Option<u64>,
    pub total_ms: u64,
}

/// Per-request settings
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub rerank_top_n: usize,
    /// Retry and per-attempt timeout for the generation call
    pub generation_policy: RetryPolicy,
    /// Deadline for the whole request
    pub request_timeout: Duration,
}

struct Progress {
    stage: Stage,
    retrieval_ms: Option<u64>,
}

impl Progress {
    fn enter(&mut self, stage: Stage) {
        tracing::debug!("ask: {} -> {}", self.stage, stage);
        self.stage = stage;
    }
}

// ============================================================================
// AnswerGenerator
// ============================================================================

pub struct AnswerGenerator {
    search: Arc<HybridSearchEngine>,
    reranker: Arc<Reranker>,
    assembler: ContextAssembler,
    generator: Arc<dyn GenerationClient>,
    options: AnswerOptions,
}

impl AnswerGenerator {
    pub fn new(
        search: Arc<HybridSearchEngine>,
        reranker: Arc<Reranker>,
        assembler: ContextAssembler,
        generator: Arc<dyn GenerationClient>,
        options: AnswerOptions,
    ) -> Self {
        Self {
            search,
            reranker,
            assembler,
            generator,
            options,
        }
    }

    /// Answer a question from the indexed papers with the default model
    pub async fn ask(&self, question: &str, top_k: usize) -> Result<AnswerResult, AskError> {
        self.ask_filtered(question, top_k, &SearchFilter::default(), None)
            .await
    }

    /// Answer a question using only papers matching `filter`.
    ///
    /// `model` overrides the generation model for this request only.
    pub async fn ask_filtered(
        &self,
        question: &str,
        top_k: usize,
        filter: &SearchFilter,
        model: Option<&str>,
    ) -> Result<AnswerResult, AskError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.options.request_timeout;
        let mut progress = Progress {
            stage: Stage::Received,
            retrieval_ms: None,
        };

        let outcome = tokio::time::timeout_at(
            deadline,
            self.run(question, top_k, filter, model, started, &mut progress),
        )
        .await;

        let error = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => RagError::Timeout {
                operation: "request".to_string(),
                after_ms: self.options.request_timeout.as_millis() as u64,
            },
        };

        let failed = AskError {
            stage: progress.stage,
            error,
            retrieval_ms: progress.retrieval_ms,
            total_ms: elapsed_ms(started),
        };
        tracing::warn!(
            "ask: {} -> {} ({}, {} ms): {}",
            failed.stage,
            Stage::Failed,
            failed.kind(),
            failed.total_ms,
            failed.error
        );
        Err(failed)
    }

    async fn run(
        &self,
        question: &str,
        top_k: usize,
        filter: &SearchFilter,
        model: Option<&str>,
        started: Instant,
        progress: &mut Progress,
    ) -> Result<AnswerResult, RagError> {
        if question.trim().is_empty() {
            return Err(RagError::EmptyInput {
                what: "question".to_string(),
            });
        }

        let mut degradations = Vec::new();

        progress.enter(Stage::Retrieving);
        let response = self.search.search_filtered(question, top_k, filter).await?;
        if let Some(d) = response.degradation {
            degradations.push(DegradedStage {
                stage: Stage::Retrieving,
                reason: format!("{} path unavailable: {}", d.path.as_str(), d.reason),
            });
        }

        progress.enter(Stage::Reranking);
        let reranked = self
            .reranker
            .rerank(question, response.results, self.options.rerank_top_n)
            .await;
        if reranked.iter().any(|r| r.source == RerankSource::FusedRank) {
            degradations.push(DegradedStage {
                stage: Stage::Reranking,
                reason: "reranker unavailable, hybrid order kept".to_string(),
            });
        }

        progress.enter(Stage::Assembling);
        let block = self.assembler.assemble(&reranked, self.assembler.budget());
        let retrieval_ms = elapsed_ms(started);
        progress.retrieval_ms = Some(retrieval_ms);

        // Blank override means the configured model
        let requested = model.map(str::trim).filter(|m| !m.is_empty());
        let model = requested
            .unwrap_or(self.generator.model_name())
            .to_string();

        if block.is_empty() {
            progress.enter(Stage::Done);
            tracing::info!("ask: no usable context, skipping generation ({} ms)", retrieval_ms);
            return Ok(AnswerResult {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                status: AnswerStatus::InsufficientContext,
                sources: vec![],
                model,
                retrieval_ms,
                generation_ms: 0,
                total_ms: elapsed_ms(started),
                degradations,
            });
        }

        progress.enter(Stage::Generating);
        let prompt = format_prompt(&block.render(), question);
        let generation_started = Instant::now();
        let generation = self
            .options
            .generation_policy
            .run("generation", || {
                self.generator.generate(SYSTEM_PROMPT, &prompt, requested)
            })
            .await?;
        if !generation.done {
            return Err(RagError::Upstream {
                service: "generation",
                status: 200,
                message: "model returned an incomplete response".to_string(),
            });
        }
        let generation_ms = elapsed_ms(generation_started);

        progress.enter(Stage::Done);
        let total_ms = elapsed_ms(started);
        tracing::info!(
            "ask: {} sources, retrieval {} ms, generation {} ms, total {} ms",
            block.entries.len(),
            retrieval_ms,
            generation_ms,
            total_ms
        );

        Ok(AnswerResult {
            answer: generation.text,
            status: AnswerStatus::Answered,
            sources: block.citations(),
            model,
            retrieval_ms,
            generation_ms,
            total_ms,
            degradations,
        })
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, EmbeddingConfig, EmbeddingProvider};
    use crate::knowledge::hybrid::SearchConfig;
    use crate::knowledge::index::ChunkIndex;
    use crate::retrieval::context::ContextConfig;
    use crate::retrieval::rerank::RerankConfig;
    use crate::retry::RetryConfig;
    use crate::testing::{chunk, FaultyIndex, HashEmbedding, ScriptedGenerator, ScriptedReranker};
    use std::sync::atomic::Ordering;

    const DIM: usize = 16;

    struct Harness {
        index: Arc<FaultyIndex>,
        generator: Arc<ScriptedGenerator>,
        answers: AnswerGenerator,
    }

    fn fast_retry(timeout_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            timeout_ms,
        }
    }

    async fn harness(
        generator: ScriptedGenerator,
        reranker: ScriptedReranker,
        generation_timeout_ms: u64,
        request_timeout: Duration,
    ) -> Harness {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let index = Arc::new(FaultyIndex::new(DIM));

        let chunks = vec![
            chunk("p1", 0, "Low-rank adapters reduce fine-tuning memory."),
            chunk("p1", 1, "Adapters match full fine-tuning quality on GLUE."),
            chunk("p2", 0, "Quantization further reduces memory during fine-tuning."),
        ];
        let mut embeddings = Vec::new();
        for c in &chunks {
            embeddings.push(provider.embed(&c.content).await.unwrap());
        }
        index.upsert(&chunks, &embeddings).await.unwrap();

        let embedding_config = EmbeddingConfig {
            dimension: DIM,
            retry: fast_retry(1_000),
            ..Default::default()
        };
        let embedder = Arc::new(Embedder::new(provider, &embedding_config));
        let search = Arc::new(HybridSearchEngine::new(
            index.clone(),
            embedder,
            SearchConfig::default(),
        ));
        let rerank_config = RerankConfig {
            retry: fast_retry(1_000),
            ..Default::default()
        };
        let reranker = Arc::new(Reranker::new(Arc::new(reranker), &rerank_config));
        let generator = Arc::new(generator);

        let answers = AnswerGenerator::new(
            search,
            reranker,
            ContextAssembler::new(ContextConfig::default()),
            generator.clone(),
            AnswerOptions {
                rerank_top_n: 5,
                generation_policy: fast_retry(generation_timeout_ms).policy(),
                request_timeout,
            },
        );

        Harness {
            index,
            generator,
            answers,
        }
    }

    async fn default_harness(generator: ScriptedGenerator) -> Harness {
        harness(
            generator,
            ScriptedReranker::new(),
            1_000,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_answer_with_citations_and_timings() {
        let h = default_harness(ScriptedGenerator::replying("Adapters cut memory [Source 1].")).await;

        let result = h.answers.ask("How do adapters reduce memory?", 5).await.unwrap();

        assert_eq!(result.status, AnswerStatus::Answered);
        assert_eq!(result.answer, "Adapters cut memory [Source 1].");
        assert_eq!(result.model, "scripted-llm");
        assert!(!result.sources.is_empty());
        assert_eq!(result.sources[0].index, 1);
        assert!(result.sources[0].url.starts_with("https://arxiv.org/abs/"));
        assert!(result.total_ms >= result.retrieval_ms + result.generation_ms);
        assert!(result.degradations.is_empty());

        let prompts = h.generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, SYSTEM_PROMPT);
        assert!(prompts[0].1.contains("[Source 1] (Paper: "));
        assert!(prompts[0].1.contains("How do adapters reduce memory?"));
    }

    #[tokio::test]
    async fn test_model_override_is_used_and_reported() {
        let h = default_harness(ScriptedGenerator::replying("ok [Source 1].")).await;

        let result = h
            .answers
            .ask_filtered("adapters memory", 5, &SearchFilter::default(), Some("mistral"))
            .await
            .unwrap();
        assert_eq!(result.model, "mistral");

        let default = h
            .answers
            .ask_filtered("adapters memory", 5, &SearchFilter::default(), Some("  "))
            .await
            .unwrap();
        assert_eq!(default.model, "scripted-llm");

        assert_eq!(h.generator.models(), vec![Some("mistral".to_string()), None]);
    }

    #[tokio::test]
    async fn test_empty_context_skips_generation() {
        let h = default_harness(ScriptedGenerator::replying("unused")).await;
        h.index.delete_by_document("p1").await.unwrap();
        h.index.delete_by_document("p2").await.unwrap();

        let result = h.answers.ask("anything at all?", 5).await.unwrap();
        assert_eq!(result.status, AnswerStatus::InsufficientContext);
        assert_eq!(result.answer, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(result.sources.is_empty());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generation_timeout_reports_retrieval_timing() {
        let h = harness(
            ScriptedGenerator::replying("late").with_delay(Duration::from_millis(500)),
            ScriptedReranker::new(),
            50,
            Duration::from_secs(5),
        )
        .await;

        let err = h.answers.ask("adapters memory", 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage, Stage::Generating);
        assert!(err.retrieval_ms.is_some());
        assert!(err.total_ms >= err.retrieval_ms.unwrap());
    }

    #[tokio::test]
    async fn test_request_deadline_cancels_generation() {
        let h = harness(
            ScriptedGenerator::replying("late").with_delay(Duration::from_secs(10)),
            ScriptedReranker::new(),
            60_000,
            Duration::from_millis(100),
        )
        .await;

        let err = h.answers.ask("adapters memory", 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage, Stage::Generating);
        assert!(err.to_string().contains("request timed out"));
    }

    #[tokio::test]
    async fn test_failure_report_fields() {
        let h = harness(
            ScriptedGenerator::replying("late").with_delay(Duration::from_millis(500)),
            ScriptedReranker::new(),
            50,
            Duration::from_secs(5),
        )
        .await;

        let err = h.answers.ask("adapters memory", 5).await.unwrap_err();
        let json = serde_json::to_value(err.report()).unwrap();

        assert_eq!(json["stage"], "generating");
        assert_eq!(json["kind"], "timeout");
        assert!(json["reason"].as_str().unwrap().contains("timed out"));
        assert!(json["retrieval_ms"].is_u64());
        assert_eq!(json["total_ms"], err.total_ms);
    }

    #[tokio::test]
    async fn test_failure_report_before_retrieval() {
        let h = default_harness(ScriptedGenerator::replying("unused")).await;
        let err = h.answers.ask("", 5).await.unwrap_err();
        let json = serde_json::to_value(err.report()).unwrap();

        assert_eq!(json["stage"], "received");
        assert_eq!(json["kind"], "empty_input");
        assert!(json["retrieval_ms"].is_null());
    }

    #[tokio::test]
    async fn test_incomplete_generation_is_error() {
        let h = default_harness(ScriptedGenerator::replying("half an ans").incomplete()).await;

        let err = h.answers.ask("adapters memory", 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.stage, Stage::Generating);
    }

    #[tokio::test]
    async fn test_reranker_failure_is_degradation() {
        let h = harness(
            ScriptedGenerator::replying("ok"),
            ScriptedReranker::new().failing(),
            1_000,
            Duration::from_secs(5),
        )
        .await;

        let result = h.answers.ask("adapters memory", 5).await.unwrap();
        assert_eq!(result.status, AnswerStatus::Answered);
        assert_eq!(result.degradations.len(), 1);
        assert_eq!(result.degradations[0].stage, Stage::Reranking);
    }

    #[tokio::test]
    async fn test_lexical_outage_still_answers() {
        let h = default_harness(ScriptedGenerator::replying("ok")).await;
        h.index.set_lexical_down(true);

        let result = h.answers.ask("adapters memory", 5).await.unwrap();
        assert_eq!(result.status, AnswerStatus::Answered);
        assert!(result
            .degradations
            .iter()
            .any(|d| d.stage == Stage::Retrieving && d.reason.starts_with("lexical")));
    }

    #[tokio::test]
    async fn test_index_down_fails_in_retrieval() {
        let h = default_harness(ScriptedGenerator::replying("unused")).await;
        h.index.set_lexical_down(true);
        h.index.set_vector_down(true);

        let err = h.answers.ask("adapters memory", 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexUnavailable);
        assert_eq!(err.stage, Stage::Retrieving);
        assert!(err.retrieval_ms.is_none());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let h = default_harness(ScriptedGenerator::replying("unused")).await;
        let err = h.answers.ask("   ", 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyInput);
        assert_eq!(err.stage, Stage::Received);
    }
}
