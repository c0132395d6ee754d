//! arxiv-rag - grounded question answering over arXiv papers
//!
//! Parsed papers are chunked, embedded and stored in a SQLite FTS5 table
//! plus a LanceDB vector table. Questions run hybrid search (min-max
//! fused), cross-encoder reranking and token-budgeted context assembly
//! before a local model writes an answer citing `[Source N]`.

pub mod app;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod retrieval;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use app::{Clients, RagApp};
pub use config::RagConfig;
pub use embedding::{Embedder, EmbeddingConfig, EmbeddingProvider, OllamaEmbedding};
pub use error::{ErrorKind, RagError, Result};
pub use generation::{
    AnswerGenerator, AnswerResult, AnswerStatus, AskError, AskFailure, GenerationClient,
    OllamaGenerator, Stage,
};
pub use knowledge::{
    Chunk, ChunkConfig, ChunkIndex, Chunker, Document, HybridSearchEngine, Indexer, LocalIndex,
    MemoryIndex, SearchFilter, SearchMethod, SearchResponse, SearchResult, SemanticChunker,
};
pub use retrieval::{Citation, ContextAssembler, ContextBlock, HttpReranker, RerankClient, Reranker};
