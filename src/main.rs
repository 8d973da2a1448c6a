//! # chat-recall CLI (`recall`)
//!
//! The `recall` binary is the operational surface for chat-recall. It
//! provides commands for database initialization, message ingestion,
//! retrieval, question answering, chunk administration, and the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the SQLite database schema |
//! | `recall ingest <tenant>` | Ingest JSONL messages from stdin |
//! | `recall ask <tenant> "<question>"` | Answer a question from indexed history |
//! | `recall search <tenant> "<query>"` | Show ranked chunks without generating an answer |
//! | `recall recent <tenant>` | List the most recent chunks |
//! | `recall purge <tenant> --count N` | Delete the N most recent chunks |
//! | `recall serve` | Start the HTTP ingestion/query server |

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use chat_recall::answer::{ask, create_answerer, TRY_AGAIN_REPLY};
use chat_recall::config::{load_config, Config};
use chat_recall::db;
use chat_recall::embedding::create_embedder;
use chat_recall::error::EngineError;
use chat_recall::ingest::{ingest, IngestOutcome, IngestState};
use chat_recall::migrate;
use chat_recall::models::RawMessage;
use chat_recall::purge::purge_recent;
use chat_recall::retrieve::{retrieve, RetrievalRequest};
use chat_recall::server::run_server;
use chat_recall::store::{ChunkStore, SqliteStore};

/// chat-recall CLI — community chat memory with chunked retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/recall.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "chat-recall — chunk, embed, and answer questions over community chat history",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the chunks table. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Ingest messages for a tenant from stdin.
    ///
    /// Reads one JSON message per line: `{"channel_id": "general",
    /// "author": "ada", "author_id": 7, "content": "hi", "category":
    /// "Chatter", "timestamp": "2026-08-05T12:00:00Z"}`. `category` and
    /// `timestamp` are optional. Prints buffered/flushed/skipped counts.
    Ingest {
        /// Tenant (community) id.
        tenant_id: i64,
    },

    /// Answer a question from the tenant's indexed history.
    Ask {
        tenant_id: i64,
        /// The question text.
        question: String,
    },

    /// Show ranked chunks for a query without generating an answer.
    Search {
        tenant_id: i64,
        /// The query text.
        query: String,

        /// Maximum number of chunks to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Disable the cosine rerank and return raw index order.
        #[arg(long)]
        no_rerank: bool,
    },

    /// List the tenant's most recent chunks, newest first.
    Recent {
        tenant_id: i64,

        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Delete the tenant's N most recent chunks.
    Purge {
        tenant_id: i64,

        /// How many chunks to delete.
        #[arg(long)]
        count: i64,
    },

    /// Start the HTTP ingestion/query server.
    Serve,
}

/// One stdin line of `recall ingest`. The tenant comes from the command
/// argument; a missing timestamp means "now".
#[derive(Deserialize)]
struct IngestLine {
    channel_id: String,
    author: String,
    author_id: i64,
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Ingest { tenant_id } => {
            let store = open_store(&config).await?;
            let embedder = create_embedder(&config.embedding)?;
            let state = IngestState::new(config.chunking.chunk_size);

            let mut buffered = 0u64;
            let mut flushed = 0u64;
            let mut skipped = 0u64;
            let mut failed = 0u64;

            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: IngestLine = serde_json::from_str(&line)?;
                let message = RawMessage {
                    tenant_id,
                    channel_id: parsed.channel_id,
                    author: parsed.author,
                    author_id: parsed.author_id,
                    content: parsed.content,
                    category: parsed.category,
                    timestamp: parsed.timestamp.unwrap_or_else(Utc::now),
                };

                match ingest(&state, store.as_ref(), embedder.as_ref(), message).await {
                    Ok(IngestOutcome::Buffered) => buffered += 1,
                    Ok(IngestOutcome::Flushed(_)) => flushed += 1,
                    Ok(IngestOutcome::Skipped(_)) => skipped += 1,
                    // The batch was requeued; a later line may flush it.
                    Err(_) => failed += 1,
                }
            }

            println!("ingest tenant {}", tenant_id);
            println!("  buffered: {}", buffered);
            println!("  chunks flushed: {}", flushed);
            println!("  skipped: {}", skipped);
            if failed > 0 {
                println!("  failed flushes (requeued): {}", failed);
            }
            println!("ok");
        }

        Commands::Ask {
            tenant_id,
            question,
        } => {
            let store = open_store(&config).await?;
            let embedder = create_embedder(&config.embedding)?;
            let answerer = create_answerer(&config.answerer)?;

            let result = ask(
                store.as_ref(),
                embedder.as_ref(),
                answerer.as_ref(),
                &config.retrieval,
                tenant_id,
                &question,
            )
            .await;

            match result {
                Ok(answer) => println!("{}", answer),
                Err(EngineError::AnswererFailure { .. }) => println!("{}", TRY_AGAIN_REPLY),
                Err(err) => return Err(err.into()),
            }
        }

        Commands::Search {
            tenant_id,
            query,
            top_k,
            no_rerank,
        } => {
            let store = open_store(&config).await?;
            let embedder = create_embedder(&config.embedding)?;

            let req = RetrievalRequest {
                tenant_id,
                query: &query,
                top_k: top_k.unwrap_or(config.retrieval.top_k),
                rerank: !no_rerank && config.retrieval.rerank,
            };
            let results = retrieve(store.as_ref(), embedder.as_ref(), &req).await?;

            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }

            for (i, chunk) in results.iter().enumerate() {
                match chunk.similarity {
                    Some(similarity) => {
                        println!("{}. [cosine {:.4}] {}", i + 1, similarity, chunk.id)
                    }
                    None => println!("{}. [l2 {:.4}] {}", i + 1, chunk.distance, chunk.id),
                }
                println!("    excerpt: \"{}\"", excerpt(&chunk.text));
                println!();
            }
        }

        Commands::Recent { tenant_id, limit } => {
            let store = open_store(&config).await?;
            let recent = store.fetch_recent(tenant_id, limit).await?;

            if recent.is_empty() {
                println!("No chunks.");
                return Ok(());
            }

            for chunk in &recent {
                let date = chrono::DateTime::from_timestamp(chunk.started_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{}  {}", chunk.id, date);
                println!("    excerpt: \"{}\"", excerpt(&chunk.text));
            }
        }

        Commands::Purge { tenant_id, count } => {
            if count < 1 {
                anyhow::bail!("--count must be >= 1");
            }
            let store = open_store(&config).await?;
            let deleted = purge_recent(store.as_ref(), tenant_id, count).await?;
            println!("deleted {} chunks for tenant {}", deleted, tenant_id);
        }

        Commands::Serve => {
            let store = open_store(&config).await?;
            let embedder: Arc<dyn chat_recall::embedding::Embedder> =
                Arc::from(create_embedder(&config.embedding)?);
            let answerer: Arc<dyn chat_recall::answer::Answerer> =
                Arc::from(create_answerer(&config.answerer)?);
            run_server(&config, store, embedder, answerer).await?;
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn ChunkStore>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() > 120 {
        let cut: String = trimmed.chars().take(120).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}
