//! CLI module
//!
//! arxiv-rag command definitions and implementations

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::app::RagApp;
use crate::config::RagConfig;
use crate::generation::answer::{AnswerResult, AnswerStatus};
use crate::knowledge::hybrid::{SearchFilter, SearchMethod};
use crate::knowledge::index::ChunkIndex;
use crate::knowledge::local::LocalIndex;
use crate::knowledge::types::{Document, ParsingStatus};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "arxiv-rag")]
#[command(version, about = "Grounded question answering over arXiv papers", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ./arxiv-rag.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chunk, embed and index a parsed paper (Markdown)
    Index {
        /// Markdown file with the parsed paper text
        #[arg(short, long)]
        file: PathBuf,

        /// Document id
        #[arg(long)]
        id: String,

        /// arXiv identifier (e.g. 2401.12345)
        #[arg(long)]
        arxiv_id: String,

        /// Paper title
        #[arg(short, long)]
        title: String,

        /// arXiv category (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Publication date (YYYY-MM-DD)
        #[arg(long)]
        published: Option<NaiveDate>,
    },

    /// Hybrid search over indexed chunks
    Search {
        query: String,

        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        #[command(flatten)]
        filter: FilterArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Answer a question with citations
    Ask {
        question: String,

        /// Candidates retrieved before reranking
        #[arg(short = 'k', long, default_value = "10")]
        top_k: usize,

        #[command(flatten)]
        filter: FilterArgs,

        /// Generation model for this question (default: generation.model)
        #[arg(short, long)]
        model: Option<String>,

        /// Print JSON (answer or failure) instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove every chunk of a document
    Delete {
        #[arg(long)]
        id: String,
    },

    /// Show index and model configuration
    Status,
}

/// Metadata filters shared by `search` and `ask`
#[derive(clap::Args, Debug, Default)]
pub struct FilterArgs {
    /// Only papers in this arXiv category (repeatable)
    #[arg(long = "category")]
    pub categories: Vec<String>,

    /// Only papers published in the last N days
    #[arg(long)]
    pub since_days: Option<u32>,
}

impl FilterArgs {
    fn to_filter(&self, today: NaiveDate) -> SearchFilter {
        let mut filter = match self.since_days {
            Some(days) => SearchFilter::recent(days, today),
            None => SearchFilter::default(),
        };
        filter.categories = self.categories.clone();
        filter
    }
}

// ============================================================================
// CLI Runner
// ============================================================================

pub async fn run(cli: Cli) -> Result<()> {
    let config = RagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Index {
            file,
            id,
            arxiv_id,
            title,
            categories,
            published,
        } => {
            let document = read_document(&file, id, arxiv_id, title, categories, published)?;
            cmd_index(config, &document).await
        }
        Commands::Search {
            query,
            top_k,
            filter,
            json,
        } => cmd_search(config, &query, top_k, &filter, json).await,
        Commands::Ask {
            question,
            top_k,
            filter,
            model,
            json,
        } => cmd_ask(config, &question, top_k, &filter, model.as_deref(), json).await,
        Commands::Delete { id } => cmd_delete(config, &id).await,
        Commands::Status => cmd_status(config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_index(config: RagConfig, document: &Document) -> Result<()> {
    let app = RagApp::open(config).await.context("Failed to open index")?;

    println!("[*] Indexing {} ({})...", document.id, document.arxiv_id);
    let report = app
        .index_document(document)
        .await
        .context("Indexing failed")?;

    println!(
        "[OK] {} chunks indexed ({} replaced)",
        report.chunks_indexed, report.superseded
    );
    Ok(())
}

async fn cmd_search(
    config: RagConfig,
    query: &str,
    top_k: usize,
    filter: &FilterArgs,
    json: bool,
) -> Result<()> {
    let app = RagApp::open(config).await.context("Failed to open index")?;
    let filter = filter.to_filter(chrono::Local::now().date_naive());

    let response = app
        .search(query, top_k, &filter)
        .await
        .context("Search failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if let Some(ref degradation) = response.degradation {
        println!(
            "[!] {} search unavailable: {}",
            degradation.path.as_str(),
            degradation.reason
        );
    }

    if response.results.is_empty() {
        println!("[!] No results.");
        return Ok(());
    }

    println!("[OK] {} results:\n", response.results.len());

    for (i, result) in response.results.iter().enumerate() {
        let method_str = match result.method {
            SearchMethod::Lexical => "LEX",
            SearchMethod::Vector => "VEC",
            SearchMethod::Fused => "HYB",
        };
        let chunk = &result.chunk;

        println!(
            "{}. [{}] [score: {:.4}] {} #{}",
            i + 1,
            method_str,
            result.score,
            chunk.metadata.arxiv_id,
            chunk.chunk_index
        );
        println!("   Title: {}", truncate_text(&chunk.metadata.title, 80));
        if let Some(ref section) = chunk.section_title {
            println!("   Section: {}", section);
        }
        println!("   {}", truncate_text(&chunk.content, 200));
        println!();
    }

    Ok(())
}

async fn cmd_ask(
    config: RagConfig,
    question: &str,
    top_k: usize,
    filter: &FilterArgs,
    model: Option<&str>,
    json: bool,
) -> Result<()> {
    let app = RagApp::open(config).await.context("Failed to open index")?;
    let filter = filter.to_filter(chrono::Local::now().date_naive());

    let result = match app.ask(question, top_k, &filter, model).await {
        Ok(result) => result,
        Err(e) if json => {
            println!("{}", serde_json::to_string_pretty(&e.report())?);
            bail!("ask failed while {} ({})", e.stage, e.kind())
        }
        Err(e) => bail!(
            "{} (kind: {}, after {} ms)",
            e,
            e.kind(),
            e.total_ms
        ),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_answer(&result);
    }
    Ok(())
}

async fn cmd_delete(config: RagConfig, id: &str) -> Result<()> {
    let app = RagApp::open(config).await.context("Failed to open index")?;

    let removed = app
        .delete_document(id)
        .await
        .context("Delete failed")?;

    if removed == 0 {
        println!("[!] No chunks found for document {}", id);
    } else {
        println!("[OK] Document {} removed ({} chunks)", id, removed);
    }
    Ok(())
}

/// Reads the local index directly; model services are not contacted
async fn cmd_status(config: RagConfig) -> Result<()> {
    println!("arxiv-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] Data directory: {}", config.data_dir.display());
    println!(
        "[*] Embedding: {} ({} dims) @ {}",
        config.embedding.model, config.embedding.dimension, config.embedding.base_url
    );
    println!("[*] Reranker: {} @ {}", config.rerank.model, config.rerank.url);
    println!(
        "[*] Generation: {} @ {}",
        config.generation.model, config.generation.base_url
    );

    match LocalIndex::open(&config.data_dir, config.embedding.dimension).await {
        Ok(index) => {
            match index.store().stats() {
                Ok(stats) => {
                    println!(
                        "[OK] Chunks: {} across {} documents",
                        stats.chunk_count, stats.document_count
                    );
                    println!(
                        "     Content: {}",
                        format_bytes(stats.total_content_bytes)
                    );
                }
                Err(e) => println!("[!] Failed to read chunk stats: {}", e),
            }
            match index.stats().await {
                Ok(stats) => println!("[OK] Vectors: {}", stats.vector_count),
                Err(e) => tracing::debug!("Vector stats unavailable: {}", e),
            }
        }
        Err(e) => println!("[!] Failed to open index: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_document(
    file: &Path,
    id: String,
    arxiv_id: String,
    title: String,
    categories: Vec<String>,
    published_date: Option<NaiveDate>,
) -> Result<Document> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    Ok(Document {
        id,
        arxiv_id,
        title,
        text: Some(text),
        categories,
        published_date,
        status: ParsingStatus::Parsed,
    })
}

fn print_answer(result: &AnswerResult) {
    println!("{}", result.answer.trim());
    println!();

    if result.status == AnswerStatus::InsufficientContext {
        println!("[!] No relevant context found.");
    }

    if !result.sources.is_empty() {
        println!("Sources:");
        for source in &result.sources {
            let section = source
                .section
                .as_deref()
                .map(|s| format!(", {}", s))
                .unwrap_or_default();
            println!(
                "  [{}] {}{} ({:.2})",
                source.index,
                truncate_text(&source.title, 60),
                section,
                source.relevance_score
            );
            println!("      {}", source.url);
        }
        println!();
    }

    for degradation in &result.degradations {
        println!("[!] {}: {}", degradation.stage, degradation.reason);
    }

    println!(
        "[*] {} | retrieval {} ms, generation {} ms, total {} ms",
        result.model, result.retrieval_ms, result.generation_ms, result.total_ms
    );
}

/// Truncate for display (UTF-8 safe)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
