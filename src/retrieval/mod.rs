//! Retrieval post-processing - reranking and context assembly

pub mod context;
pub mod rerank;

pub use context::{Citation, ContextAssembler, ContextBlock, ContextConfig, ContextEntry};
pub use rerank::{
    HttpReranker, RerankClient, RerankConfig, RerankSource, RerankedResult, Reranker,
};
