//! Document indexing: chunk → embed → retire old chunks → upsert
//!
//! One writer per document id at a time ([`DocumentLocks`]); different
//! documents index concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::embedding::Embedder;
use crate::error::{RagError, Result};

use super::chunker::Chunker;
use super::index::{check_upsert, ChunkIndex};
use super::types::Document;

// ============================================================================
// DocumentLocks
// ============================================================================

/// Per-document async mutexes, created on demand and dropped when unused
#[derive(Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex for `document_id`, shared with any concurrent holder
    pub fn lock_for(&self, document_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| RagError::Internal(format!("Lock error: {}", e)))?;

        if let Some(existing) = locks.get(document_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(document_id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Tracked entries (live or not yet swept)
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed,
    /// Parsed text produced no chunks; any previous chunks were removed
    NoContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub document_id: String,
    pub outcome: IndexOutcome,
    pub chunks_indexed: usize,
    /// Chunks from a previous indexing run that were retired
    pub superseded: usize,
}

// ============================================================================
// Indexer
// ============================================================================

pub struct Indexer {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<Embedder>,
    chunker: Box<dyn Chunker>,
    locks: DocumentLocks,
}

impl Indexer {
    pub fn new(index: Arc<dyn ChunkIndex>, embedder: Arc<Embedder>, chunker: Box<dyn Chunker>) -> Self {
        Self {
            index,
            embedder,
            chunker,
            locks: DocumentLocks::new(),
        }
    }

    /// Index (or reindex) one parsed document.
    ///
    /// Embeddings are computed and checked against the index dimension
    /// before anything is deleted, so a failed model call or a mismatched
    /// model leaves the previous chunks searchable.
    pub async fn index(&self, document: &Document) -> Result<IndexReport> {
        if document.parsed_text().is_none() {
            return Err(RagError::NotParsed {
                document_id: document.id.clone(),
            });
        }

        let lock = self.locks.lock_for(&document.id)?;
        let _guard = lock.lock().await;

        let chunks = self.chunker.chunk(document);
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        check_upsert(self.index.dimension(), &chunks, &embeddings)?;

        let superseded = self.index.delete_by_document(&document.id).await?;

        if chunks.is_empty() {
            tracing::warn!("No chunks generated for document {}", document.id);
            return Ok(IndexReport {
                document_id: document.id.clone(),
                outcome: IndexOutcome::NoContent,
                chunks_indexed: 0,
                superseded,
            });
        }

        let chunks_indexed = self.index.upsert(&chunks, &embeddings).await?;

        tracing::info!(
            "Indexed document {} ({}): {} chunks, {} superseded",
            document.id,
            document.arxiv_id,
            chunks_indexed,
            superseded
        );

        Ok(IndexReport {
            document_id: document.id.clone(),
            outcome: IndexOutcome::Indexed,
            chunks_indexed,
            superseded,
        })
    }

    /// Remove every chunk of a document
    pub async fn remove(&self, document_id: &str) -> Result<usize> {
        let lock = self.locks.lock_for(document_id)?;
        let _guard = lock.lock().await;

        let removed = self.index.delete_by_document(document_id).await?;
        tracing::info!("Removed document {}: {} chunks", document_id, removed);
        Ok(removed)
    }
}

// ============================================================================
// Tests
// ============================================================================
