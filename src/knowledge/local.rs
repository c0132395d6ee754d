//! On-disk [`ChunkIndex`]: SQLite FTS5 for the lexical path, LanceDB for
//! the vector path.
//!
//! Vector hits carry only ids; the chunk body is hydrated from SQLite.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RagError, Result};

use super::index::{check_dimension, check_upsert, ChunkIndex, IndexStats, SearchFilter};
use super::lance::LanceVectorStore;
use super::store::ChunkStore;
use super::types::{Chunk, ScoredChunk};
use super::vector::{VectorEntry, VectorStore};

pub struct LocalIndex {
    store: ChunkStore,
    vectors: Arc<dyn VectorStore>,
}

impl LocalIndex {
    /// Open (or create) `chunks.db` and `vectors.lance` under `data_dir`
    pub async fn open(data_dir: &Path, dimension: usize) -> Result<Self> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).map_err(|e| {
                RagError::Internal(format!("Failed to create data directory: {}", e))
            })?;
        }

        let store = ChunkStore::open(&data_dir.join("chunks.db"))?;
        let vectors = LanceVectorStore::open(&data_dir.join("vectors.lance"), dimension).await?;

        tracing::debug!("Local index opened at {:?} (dimension {})", data_dir, dimension);
        Ok(Self::with_stores(store, Arc::new(vectors)))
    }

    pub fn with_stores(store: ChunkStore, vectors: Arc<dyn VectorStore>) -> Self {
        Self { store, vectors }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }
}

#[async_trait]
impl ChunkIndex for LocalIndex {
    fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    async fn upsert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        check_upsert(self.dimension(), chunks, embeddings)?;
        if chunks.is_empty() {
            return Ok(0);
        }

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorEntry {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                chunk_index: chunk.chunk_index as i32,
                categories: chunk.metadata.categories.clone(),
                published_date: chunk.metadata.published_date,
                embedding: embedding.clone(),
            })
            .collect();

        // Text first: a vector row without its chunk would be dropped on hydration
        self.store.upsert_chunks(chunks)?;
        match self.vectors.insert_batch(&entries).await {
            Ok(n) => Ok(n),
            Err(e) => {
                // No text row may outlive a failed vector write
                let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
                if let Err(cleanup) = self.store.delete_chunks(&ids) {
                    tracing::error!(
                        "Failed to remove {} chunks after vector insert error: {}",
                        ids.len(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn lexical_query(
        &self,
        text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        Ok(self
            .store
            .search_fts(text, k, filter)?
            .into_iter()
            .map(|(chunk, score)| ScoredChunk { chunk, score })
            .collect())
    }

    async fn vector_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        check_dimension(self.dimension(), embedding, "vector query")?;

        let hits = self.vectors.search(embedding, k, filter).await?;
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut chunks = self
            .store
            .get_chunks(&ids)
            .map_err(|e| RagError::vector_index(format!("chunk hydration failed: {}", e)))?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match chunks.remove(&hit.chunk_id) {
                Some(chunk) => results.push(ScoredChunk {
                    chunk,
                    score: hit.similarity as f64,
                }),
                None => tracing::warn!(
                    "Vector row {} (document {}) has no stored chunk, skipping",
                    hit.chunk_id,
                    hit.document_id
                ),
            }
        }
        Ok(results)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        // Vectors first
        self.vectors.delete_by_document(document_id).await?;
        self.store.delete_by_document(document_id)
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        self.store.count_for_document(document_id)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let store_stats = self.store.stats()?;
        Ok(IndexStats {
            chunk_count: store_stats.chunk_count,
            document_count: store_stats.document_count,
            vector_count: self.vectors.count().await?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::knowledge::vector::VectorHit;
    use crate::testing::chunk;
    use tempfile::TempDir;

    /// Vector backend whose writes always fail
    struct RejectingVectors;

    #[async_trait]
    impl VectorStore for RejectingVectors {
        fn dimension(&self) -> usize {
            3
        }

        async fn insert_batch(&self, _entries: &[VectorEntry]) -> Result<usize> {
            Err(RagError::vector_index("disk full"))
        }

        async fn search(
            &self,
            _query_embedding: &[f32],
            _limit: usize,
            _filter: &SearchFilter,
        ) -> Result<Vec<VectorHit>> {
            Ok(vec![])
        }

        async fn delete_by_document(&self, _document_id: &str) -> Result<usize> {
            Ok(0)
        }

        async fn count(&self) -> Result<usize> {
            Ok(0)
        }

        async fn count_for_document(&self, _document_id: &str) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_local_index_both_paths() {
        let dir = TempDir::new().unwrap();
        let index = LocalIndex::open(dir.path(), 3).await.unwrap();

        let chunks = vec![
            chunk("p1", 0, "mixture of experts routing"),
            chunk("p1", 1, "dense transformer baseline"),
        ];
        index
            .upsert(&chunks, &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
            .await
            .unwrap();

        let lexical = index.lexical_query("experts", 5, &SearchFilter::default()).await.unwrap();
        assert_eq!(lexical.len(), 1);
        assert_eq!(lexical[0].chunk.id, chunks[0].id);

        let vector = index
            .vector_query(&[0.0, 1.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(vector.len(), 2);
        assert_eq!(vector[0].chunk, chunks[1]);

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.vector_count, 2);

        assert_eq!(index.delete_by_document("p1").await.unwrap(), 2);
        assert_eq!(index.count_for_document("p1").await.unwrap(), 0);
        assert!(index
            .vector_query(&[0.0, 1.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_vector_write_leaves_no_text_rows() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).unwrap();
        let index = LocalIndex::with_stores(store, Arc::new(RejectingVectors));

        let chunks = vec![chunk("p1", 0, "orphan text"), chunk("p1", 1, "more orphan text")];
        let err = index
            .upsert(&chunks, &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexUnavailable);

        assert_eq!(index.count_for_document("p1").await.unwrap(), 0);
        assert!(index
            .lexical_query("orphan", 5, &SearchFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_filter_pushed_to_both_paths() {
        let dir = TempDir::new().unwrap();
        let index = LocalIndex::open(dir.path(), 3).await.unwrap();

        let mut chunks = Vec::new();
        let mut embeddings = Vec::new();
        for i in 0..4 {
            let mut c = chunk("vision", i, "attention attention");
            c.metadata.categories = vec!["cs.CV".to_string()];
            chunks.push(c);
            embeddings.push(vec![1.0, 0.0, 0.0]);
        }
        let mut language = chunk("language", 0, "attention over a long span of text");
        language.metadata.categories = vec!["cs.CL".to_string()];
        chunks.push(language);
        embeddings.push(vec![0.0, 1.0, 0.0]);
        index.upsert(&chunks, &embeddings).await.unwrap();

        let filter = SearchFilter {
            categories: vec!["cs.CL".to_string()],
            ..Default::default()
        };
        let lexical = index.lexical_query("attention", 1, &filter).await.unwrap();
        assert_eq!(lexical.len(), 1);
        assert_eq!(lexical[0].chunk.document_id, "language");

        let vector = index.vector_query(&[1.0, 0.0, 0.0], 1, &filter).await.unwrap();
        assert_eq!(vector.len(), 1);
        assert_eq!(vector[0].chunk.document_id, "language");
    }
}
