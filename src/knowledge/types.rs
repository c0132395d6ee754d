//! Document and Chunk types shared by the chunker, indexes and search

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Base URL for resolvable paper links
pub const ARXIV_ABS_URL: &str = "https://arxiv.org/abs/";

// ============================================================================
// Document
// ============================================================================

/// Parsing state reported by the ingestion side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsingStatus {
    Pending,
    Parsed,
    Failed,
}

/// A parsed paper (read-only to this crate)
///
/// `text` is Markdown: `#` headings delimit sections and `|` rows are tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub arxiv_id: String,
    pub title: String,
    pub text: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub published_date: Option<NaiveDate>,
    pub status: ParsingStatus,
}

impl Document {
    /// Parsed text, if the document is in the parsed state and has any
    pub fn parsed_text(&self) -> Option<&str> {
        match (self.status, self.text.as_deref()) {
            (ParsingStatus::Parsed, Some(text)) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }
}

// ============================================================================
// Chunk
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Body,
    Table,
    Heading,
    Reference,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Body => "body",
            ChunkType::Table => "table",
            ChunkType::Heading => "heading",
            ChunkType::Reference => "reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "body" => Some(ChunkType::Body),
            "table" => Some(ChunkType::Table),
            "heading" => Some(ChunkType::Heading),
            "reference" => Some(ChunkType::Reference),
            _ => None,
        }
    }
}

/// Provenance carried on every chunk so citations need no join
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub arxiv_id: String,
    pub title: String,
    pub categories: Vec<String>,
    pub published_date: Option<NaiveDate>,
}

/// Contiguous span of a document, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// UUIDv5 of (document id, ordinal), stable across reprocessing
    pub id: String,
    pub document_id: String,
    /// 0-based, ascending, no gaps within a document
    pub chunk_index: u32,
    pub content: String,
    pub section_title: Option<String>,
    pub chunk_type: ChunkType,
    pub token_count: usize,
    pub char_count: usize,
    /// SHA-256 of `content`
    pub content_hash: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Resolvable URL of the owning paper
    pub fn document_url(&self) -> String {
        url::Url::parse(ARXIV_ABS_URL)
            .and_then(|base| base.join(&self.metadata.arxiv_id))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}{}", ARXIV_ABS_URL, self.metadata.arxiv_id))
    }
}

/// A chunk with a path-specific raw score
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}
