//! Thin CLI wiring for manual exercise and smoke testing of the core
//! library's public entry points.
//!
//! This binary is deliberately minimal — no colors, no prompts, no
//! credential flows, no daemon supervision. `spec.md` places that
//! product surface out of scope as an external collaborator; this
//! mirrors the teacher's own `ctx` binary shape (parse args, call the
//! library, print the result record) without reproducing its polish.

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use axon_context_core::config_root;
use axon_context_core::embedding::HttpEmbeddingBackend;
use axon_context_core::models::{ContentType, SourceCommand};
use axon_context_core::pipeline::{DocumentMeta, EmbedPipeline, EmbedPipelineOptions};
use axon_context_core::query::{self, QueryCore, QueryRequest};
use axon_context_core::settings::SettingsStore;
use axon_context_core::source_id::SourceId;
use axon_context_core::store::qdrant::QdrantVectorStore;

#[derive(Parser)]
#[command(
    name = "axon",
    about = "Axon context core — chunk, embed, and query a local-first knowledge store",
    version
)]
struct Cli {
    /// Embedding backend base URL
    #[arg(long, global = true, env = "AXON_EMBEDDING_URL", default_value = "http://localhost:8787")]
    embedding_url: String,

    /// Vector store base URL
    #[arg(long, global = true, env = "AXON_VECTOR_STORE_URL", default_value = "http://localhost:6333")]
    vector_store_url: String,

    /// Default collection name
    #[arg(long, global = true, env = "AXON_DEFAULT_COLLECTION", default_value = "web")]
    collection: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a document and upsert its chunks, replacing any older
    /// chunks for the same source.
    Embed {
        /// Path to a local file. Omit together with --url to read
        /// content from stdin as a stdin-sourced document.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Absolute URL this content was scraped from.
        #[arg(long)]
        url: Option<String>,

        /// Override the destination collection.
        #[arg(long)]
        collection: Option<String>,

        /// Document title.
        #[arg(long)]
        title: Option<String>,

        /// Scope deletes to this source's own (url, sourceCommand) pair
        /// rather than every point at this url.
        #[arg(long)]
        hard_sync: bool,
    },

    /// Query the vector store for the closest matching documents.
    Query {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        group: bool,
    },

    /// Print the effective settings (defaults deep-merged with the
    /// on-disk document).
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Embed {
            path,
            url,
            collection,
            title,
            hard_sync,
        } => run_embed(&cli.embedding_url, &cli.vector_store_url, &cli.collection, path, url, collection, title, hard_sync).await?,
        Commands::Query {
            query,
            limit,
            domain,
            group,
        } => run_query(&cli.embedding_url, &cli.vector_store_url, &cli.collection, query, limit, domain, group).await?,
        Commands::Settings => run_settings()?,
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_embed(
    embedding_url: &str,
    vector_store_url: &str,
    default_collection: &str,
    path: Option<PathBuf>,
    url: Option<String>,
    collection: Option<String>,
    title: Option<String>,
    hard_sync: bool,
) -> anyhow::Result<()> {
    let (source_id, content, content_type) = match (&path, &url) {
        (Some(p), _) => {
            let absolute = std::fs::canonicalize(p)?;
            let content = std::fs::read_to_string(&absolute)?;
            let content_type = match absolute.extension().and_then(|e| e.to_str()) {
                Some("html") | Some("htm") => ContentType::Html,
                Some("md") | Some("markdown") => ContentType::Markdown,
                _ => ContentType::Text,
            };
            (SourceId::from_file_path(&absolute), content, content_type)
        }
        (None, Some(u)) => {
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            (SourceId::from_url(u.clone()), content, ContentType::Markdown)
        }
        (None, None) => {
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            let cwd = std::env::current_dir()?;
            (
                SourceId::from_stdin(content.as_bytes(), &cwd),
                content,
                ContentType::Text,
            )
        }
    };

    let mut meta = DocumentMeta::new(source_id, SourceCommand::Embed, content_type);
    meta.title = title;
    meta.collection = collection;
    meta.hard_sync = hard_sync;

    let embedding = Arc::new(HttpEmbeddingBackend::new(embedding_url.to_string()));
    let store = Arc::new(QdrantVectorStore::new(vector_store_url.to_string()));
    let mut options = EmbedPipelineOptions::default();
    options.default_collection = default_collection.to_string();
    let pipeline = EmbedPipeline::new(embedding, store, options);

    let outcome = pipeline.auto_embed(&content, &meta).await?;
    println!("embedded {} chunks into collection {}", outcome.chunk_count, outcome.collection);
    Ok(())
}

async fn run_query(
    embedding_url: &str,
    vector_store_url: &str,
    default_collection: &str,
    query: String,
    limit: usize,
    domain: Option<String>,
    group: bool,
) -> anyhow::Result<()> {
    let embedding = Arc::new(HttpEmbeddingBackend::new(embedding_url.to_string()));
    let store = Arc::new(QdrantVectorStore::new(vector_store_url.to_string()));
    let core = QueryCore::new(embedding, store);

    let response = core
        .query(QueryRequest {
            query,
            limit,
            domain,
            collection: default_collection.to_string(),
            group,
            temporal_scope: None,
        })
        .await?;

    if response.scope_fallback {
        println!("(no results within the requested time scope, showing unscoped results)");
    }
    for item in response.items {
        println!("{:.3}  {}", item.score, item.url);
        if let Some(title) = &item.title {
            println!("    {title}");
        }
        println!("    {}", query::extract_snippet(&item.chunk_text));
    }
    Ok(())
}

fn run_settings() -> anyhow::Result<()> {
    let store = SettingsStore::new(config_root::settings_path());
    let settings = store.get()?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
