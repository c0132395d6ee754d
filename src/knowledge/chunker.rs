//! Text Chunking Module
//!
//! Structure-aware splitting of parsed papers into [`Chunk`]s.
//! Sections come from Markdown headings, tables are chunked apart from
//! prose, and consecutive body chunks of a section share an overlap of
//! `overlap_tokens` tokens. Tokens are whitespace-delimited words, so a
//! split never lands inside a word.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};

use super::types::{Chunk, ChunkMetadata, ChunkType, Document};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunking settings (token counts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Hard upper bound on tokens per chunk
    pub max_tokens: usize,
    /// Tokens repeated from the previous body chunk of the same section
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 50,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RagError::InvalidConfig(
                "chunking.max_tokens must be > 0".to_string(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(RagError::InvalidConfig(format!(
                "chunking.overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }

    /// Largest unit that fits in any chunk, with or without an overlap prefix
    fn unit_capacity(&self) -> usize {
        self.max_tokens - self.overlap_tokens
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// Document chunking strategy
pub trait Chunker: Send + Sync {
    /// Split a document into ordered chunks; no text means no chunks
    fn chunk(&self, document: &Document) -> Vec<Chunk>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// SemanticChunker
// ============================================================================

/// Section- and table-aware chunker for parsed papers
pub struct SemanticChunker {
    config: ChunkConfig,
}

#[derive(Debug)]
struct Section {
    title: Option<String>,
    body: String,
}

#[derive(Debug)]
enum Block {
    Prose(String),
    Table(Vec<String>),
}

/// Pending chunk before ids and metadata are attached
struct Piece {
    content: String,
    section_title: Option<String>,
    chunk_type: ChunkType,
}

impl SemanticChunker {
    /// Rejects configs whose overlap leaves no room for content
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: ChunkConfig::default(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Split Markdown into sections at headings outside code fences
    fn split_sections(&self, text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut current = Section {
            title: None,
            body: String::new(),
        };
        let mut in_code_block = false;

        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
            }

            let heading = if in_code_block {
                None
            } else {
                heading_re()
                    .captures(line)
                    .and_then(|c| c.get(2))
                    .map(|m| m.as_str().trim().to_string())
            };

            if let Some(title) = heading {
                if current.title.is_some() || !current.body.trim().is_empty() {
                    sections.push(current);
                }
                current = Section {
                    title: Some(title),
                    body: String::new(),
                };
                continue;
            }

            current.body.push_str(line);
            current.body.push('\n');
        }

        if current.title.is_some() || !current.body.trim().is_empty() {
            sections.push(current);
        }

        sections
    }

    /// Split a section body into paragraphs and tables
    fn split_blocks(body: &str) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut paragraph: Vec<&str> = Vec::new();
        let mut table: Vec<String> = Vec::new();

        fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
            let text = paragraph.join("\n");
            if !text.trim().is_empty() {
                blocks.push(Block::Prose(text.trim().to_string()));
            }
            paragraph.clear();
        }

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('|') {
                flush_paragraph(&mut paragraph, &mut blocks);
                table.push(trimmed.to_string());
                continue;
            }
            if !table.is_empty() {
                blocks.push(Block::Table(std::mem::take(&mut table)));
            }
            if trimmed.is_empty() {
                flush_paragraph(&mut paragraph, &mut blocks);
            } else {
                paragraph.push(line);
            }
        }

        flush_paragraph(&mut paragraph, &mut blocks);
        if !table.is_empty() {
            blocks.push(Block::Table(table));
        }

        blocks
    }

    /// Chunk one section into pieces, in document order
    fn chunk_section(&self, section: &Section, pieces: &mut Vec<Piece>) {
        let blocks = Self::split_blocks(&section.body);

        if blocks.is_empty() {
            if let Some(ref title) = section.title {
                for content in token_windows(title, self.config.max_tokens) {
                    pieces.push(Piece {
                        content,
                        section_title: section.title.clone(),
                        chunk_type: ChunkType::Heading,
                    });
                }
            }
            return;
        }

        let prose_type = if section.title.as_deref().is_some_and(is_reference_title) {
            ChunkType::Reference
        } else {
            ChunkType::Body
        };

        let mut packer = ProsePacker::new(&self.config);

        for block in blocks {
            match block {
                Block::Prose(paragraph) => {
                    for content in packer.push_paragraph(&paragraph, self.config.unit_capacity()) {
                        pieces.push(Piece {
                            content,
                            section_title: section.title.clone(),
                            chunk_type: prose_type,
                        });
                    }
                }
                Block::Table(rows) => {
                    // Prose packed so far precedes the table in document order
                    if let Some(content) = packer.flush() {
                        pieces.push(Piece {
                            content,
                            section_title: section.title.clone(),
                            chunk_type: prose_type,
                        });
                    }
                    for content in pack_table(&rows, self.config.max_tokens) {
                        pieces.push(Piece {
                            content,
                            section_title: section.title.clone(),
                            chunk_type: ChunkType::Table,
                        });
                    }
                }
            }
        }

        if let Some(content) = packer.flush() {
            pieces.push(Piece {
                content,
                section_title: section.title.clone(),
                chunk_type: prose_type,
            });
        }
    }
}

impl Chunker for SemanticChunker {
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let Some(text) = document.parsed_text() else {
            return vec![];
        };

        let mut pieces = Vec::new();
        for section in self.split_sections(text) {
            self.chunk_section(&section, &mut pieces);
        }

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| make_chunk(document, i as u32, piece))
            .collect();

        tracing::debug!(
            "Document {} ({}): {} chunks",
            document.id,
            document.arxiv_id,
            chunks.len()
        );
        chunks
    }

    fn name(&self) -> &'static str {
        "SemanticChunker"
    }
}

// ============================================================================
// ProsePacker
// ============================================================================

/// Greedy packer for body text with a token overlap between chunks.
///
/// The overlap tail survives interleaved tables, so consecutive body
/// chunks of a section always share it.
struct ProsePacker {
    max_tokens: usize,
    overlap_tokens: usize,
    buf: String,
    buf_tokens: usize,
    fresh_tokens: usize,
    tail: Option<String>,
}

impl ProsePacker {
    fn new(config: &ChunkConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            overlap_tokens: config.overlap_tokens,
            buf: String::new(),
            buf_tokens: 0,
            fresh_tokens: 0,
            tail: None,
        }
    }

    /// Add a paragraph; returns chunks completed along the way
    fn push_paragraph(&mut self, paragraph: &str, unit_capacity: usize) -> Vec<String> {
        let mut done = Vec::new();
        let mut first = true;

        for unit in split_units(paragraph, unit_capacity) {
            let tokens = count_tokens(&unit);
            if self.fresh_tokens > 0 && self.buf_tokens + tokens > self.max_tokens {
                done.extend(self.flush());
            }
            if self.buf.is_empty() {
                if let Some(tail) = self.tail.take() {
                    self.buf_tokens = count_tokens(&tail);
                    self.buf = tail;
                }
            }
            if !self.buf.is_empty() {
                self.buf.push_str(if first { "\n\n" } else { " " });
            }
            self.buf.push_str(&unit);
            self.buf_tokens += tokens;
            self.fresh_tokens += tokens;
            first = false;
        }

        done
    }

    /// Emit the current chunk, remembering its tail for the next one
    fn flush(&mut self) -> Option<String> {
        if self.fresh_tokens == 0 {
            // Only an overlap prefix: keep it for the next chunk
            if !self.buf.is_empty() {
                self.tail = Some(std::mem::take(&mut self.buf));
            }
            self.buf_tokens = 0;
            return None;
        }

        let content = std::mem::take(&mut self.buf);
        self.tail = if self.overlap_tokens > 0 {
            Some(last_tokens(&content, self.overlap_tokens))
        } else {
            None
        };
        self.buf_tokens = 0;
        self.fresh_tokens = 0;
        Some(content)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").expect("valid heading pattern"))
}

/// Number of whitespace-delimited tokens
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

fn is_reference_title(title: &str) -> bool {
    let lower = title.trim().to_lowercase();
    lower.ends_with("references") || lower.ends_with("bibliography")
}

/// Break a paragraph into units no larger than `capacity` tokens:
/// whole paragraph, else sentences, else token windows
fn split_units(paragraph: &str, capacity: usize) -> Vec<String> {
    if count_tokens(paragraph) <= capacity {
        return vec![paragraph.trim().to_string()];
    }

    let mut units = Vec::new();
    for sentence in split_sentences(paragraph) {
        if count_tokens(sentence) <= capacity {
            units.push(normalize_ws(sentence));
        } else {
            units.extend(token_windows(sentence, capacity));
        }
    }
    units
}

/// Split after `.`, `!` or `?` followed by whitespace
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next_idx, next)) = chars.peek() {
                if next.is_whitespace() {
                    let sentence = text[start..next_idx].trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                    start = next_idx;
                }
            }
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Consecutive windows of at most `size` tokens
fn token_windows(text: &str, size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(size.max(1))
        .map(|w| w.join(" "))
        .collect()
}

fn last_tokens(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

/// Collapse internal whitespace runs inside a line-wrapped paragraph
fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pack table rows into chunks without splitting a row
fn pack_table(rows: &[String], max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut buf_tokens = 0;

    for row in rows {
        let tokens = count_tokens(row);
        if tokens > max_tokens {
            // Oversized row: the only case where a row is cut
            if !buf.is_empty() {
                chunks.push(buf.join("\n"));
                buf.clear();
                buf_tokens = 0;
            }
            chunks.extend(token_windows(row, max_tokens));
            continue;
        }
        if !buf.is_empty() && buf_tokens + tokens > max_tokens {
            chunks.push(buf.join("\n"));
            buf.clear();
            buf_tokens = 0;
        }
        buf.push(row);
        buf_tokens += tokens;
    }

    if !buf.is_empty() {
        chunks.push(buf.join("\n"));
    }
    chunks
}

fn make_chunk(document: &Document, index: u32, piece: Piece) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(piece.content.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document.id, index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document.id.clone(),
        chunk_index: index,
        token_count: count_tokens(&piece.content),
        char_count: piece.content.chars().count(),
        content: piece.content,
        section_title: piece.section_title,
        chunk_type: piece.chunk_type,
        content_hash,
        metadata: ChunkMetadata {
            arxiv_id: document.arxiv_id.clone(),
            title: document.title.clone(),
            categories: document.categories.clone(),
            published_date: document.published_date,
        },
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

pub fn semantic_chunker(config: ChunkConfig) -> Result<Box<dyn Chunker>> {
    Ok(Box::new(SemanticChunker::new(config)?))
}

// ============================================================================
// Tests
// ============================================================================
