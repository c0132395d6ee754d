//! Configuration loading
//!
//! Layers, later wins: built-in defaults, `arxiv-rag.toml` (or an explicit
//! `--config` file), then `ARXIV_RAG_*` environment variables with nested
//! keys split on `__` (e.g. `ARXIV_RAG_GENERATION__MODEL=mistral`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::generation::llm::GenerationConfig;
use crate::knowledge::chunker::ChunkConfig;
use crate::knowledge::hybrid::SearchConfig;
use crate::knowledge::store::get_data_dir;
use crate::retrieval::context::ContextConfig;
use crate::retrieval::rerank::RerankConfig;

pub const DEFAULT_CONFIG_FILE: &str = "arxiv-rag.toml";
pub const ENV_PREFIX: &str = "ARXIV_RAG_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Holds `chunks.db` and `vectors.lance`
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub rerank: RerankConfig,
    pub chunking: ChunkConfig,
    pub search: SearchConfig,
    pub context: ContextConfig,
    /// Deadline for a whole `ask`
    pub request_timeout_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            rerank: RerankConfig::default(),
            chunking: ChunkConfig::default(),
            search: SearchConfig::default(),
            context: ContextConfig::default(),
            request_timeout_secs: 180,
        }
    }
}

impl RagConfig {
    /// Load and validate. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) if !p.exists() => {
                return Err(RagError::InvalidConfig(format!(
                    "config file not found: {}",
                    p.display()
                )))
            }
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: RagConfig = Self::figment(&file)
            .extract()
            .map_err(|e| RagError::InvalidConfig(e.to_string()))?;
        config.validate()?;

        tracing::debug!("Loaded configuration (data dir: {})", config.data_dir.display());
        Ok(config)
    }

    /// source: https://docs.rs/figment/0.10/figment/providers/struct.Env.html#method.split
    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(RagConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.search.validate()?;
        self.context.validate()?;

        if self.embedding.dimension == 0 {
            return Err(RagError::InvalidConfig(
                "embedding.dimension must be > 0".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 || self.rerank.batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.rerank.top_n == 0 {
            return Err(RagError::InvalidConfig(
                "rerank.top_n must be > 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(RagError::InvalidConfig(format!(
                "generation.temperature must be within [0, 2], got {}",
                self.generation.temperature
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(RagError::InvalidConfig(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.generation.retry.timeout_ms >= self.request_timeout_secs * 1_000 {
            tracing::warn!(
                "generation timeout ({} ms) is not below the request deadline ({} s)",
                self.generation.retry.timeout_ms,
                self.request_timeout_secs
            );
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
