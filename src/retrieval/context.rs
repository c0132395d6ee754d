//! Token-budgeted context assembly with citation markers

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::knowledge::chunker::count_tokens;

use super::rerank::RerankedResult;

/// Characters kept in a citation snippet
const SNIPPET_CHARS: usize = 200;

/// Separator between rendered sources
const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub token_budget: usize,
    /// Tokens charged per entry for its `[Source N] (...)` header
    pub citation_overhead_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: 3000,
            citation_overhead_tokens: 24,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if self.token_budget == 0 {
            return Err(RagError::InvalidConfig(
                "context.token_budget must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Provenance of one accepted source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// 1-based, matches `[Source N]` in the rendered context
    pub index: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub arxiv_id: String,
    pub title: String,
    pub section: Option<String>,
    pub relevance_score: f64,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub citation: Citation,
    pub text: String,
    /// Content tokens plus citation overhead
    pub cost: usize,
}

/// Ordered, budget-bounded context for the generation prompt
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub entries: Vec<ContextEntry>,
    pub total_tokens: usize,
    pub budget: usize,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(SOURCE_SEPARATOR)
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.entries.iter().map(|e| e.citation.clone()).collect()
    }
}

// ============================================================================
// ContextAssembler
// ============================================================================

pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn budget(&self) -> usize {
        self.config.token_budget
    }

    /// Greedily accept results in rank order until one does not fit
    pub fn assemble(&self, ranked: &[RerankedResult], token_budget: usize) -> ContextBlock {
        let mut block = ContextBlock {
            entries: Vec::new(),
            total_tokens: 0,
            budget: token_budget,
        };

        for item in ranked {
            let chunk = &item.result.chunk;
            let cost = count_tokens(&chunk.content) + self.config.citation_overhead_tokens;
            if block.total_tokens + cost > token_budget {
                break;
            }

            let index = block.entries.len() + 1;
            let section = chunk.section_title.clone();
            let text = format!(
                "[Source {}] (Paper: {} | arXiv: {} | Section: {})\n{}",
                index,
                chunk.metadata.title,
                chunk.metadata.arxiv_id,
                section.as_deref().unwrap_or(""),
                chunk.content
            );

            block.entries.push(ContextEntry {
                citation: Citation {
                    index,
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    arxiv_id: chunk.metadata.arxiv_id.clone(),
                    title: chunk.metadata.title.clone(),
                    section,
                    relevance_score: (item.rerank_score * 10_000.0).round() / 10_000.0,
                    url: chunk.document_url(),
                    snippet: snippet(&chunk.content),
                },
                text,
                cost,
            });
            block.total_tokens += cost;
        }

        tracing::debug!(
            "Assembled context: {} sources, {} / {} tokens",
            block.entries.len(),
            block.total_tokens,
            token_budget
        );
        block
    }
}

fn snippet(content: &str) -> String {
    if content.chars().count() > SNIPPET_CHARS {
        let cut: String = content.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut)
    } else {
        content.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
