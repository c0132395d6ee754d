//! Knowledge module - chunking, indexing and hybrid retrieval
//!
//! - Chunker: section/table-aware token chunking
//! - SQLite: chunk storage + FTS5 keyword search
//! - LanceDB: vector search (ANN)
//! - Hybrid: min-max fusion of both paths

pub mod chunker;
pub mod hybrid;
pub mod index;
pub mod indexer;
pub mod lance;
pub mod local;
pub mod memory;
pub mod store;
pub mod types;
pub mod vector;

// Re-exports
pub use chunker::{semantic_chunker, ChunkConfig, Chunker, SemanticChunker};
pub use hybrid::{
    Degradation, HybridSearchEngine, SearchConfig, SearchFilter, SearchMethod, SearchResponse,
    SearchResult,
};
pub use index::{ChunkIndex, IndexStats};
pub use indexer::{DocumentLocks, IndexOutcome, IndexReport, Indexer};
pub use lance::LanceVectorStore;
pub use local::LocalIndex;
pub use memory::MemoryIndex;
pub use store::{get_data_dir, ChunkStore, StoreStats};
pub use types::{Chunk, ChunkMetadata, ChunkType, Document, ParsingStatus, ScoredChunk};
pub use vector::{cosine_similarity, VectorEntry, VectorHit, VectorStore, EMBEDDING_DIMENSION};
