//! # strata
//!
//! Command-line front end for the Strata memory engine: ingest text, query
//! the graph, assemble prompt context, record chat turns and run the
//! linker maintenance passes.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use strata_core::{ConversationId, EpisodeKind, Layer, UserId};
use strata_embeddings::{EmbeddingProvider, HashEmbedder};
use strata_llm::{ChatProvider, HttpExtractionClient, OpenAiClient, OpenAiConfig};
use strata_memory::{ChatTurn, EngineParts, IngestRequest, MemoryEngine, SearchQuery};
use strata_settings::StrataSettings;
use strata_store::{ConnectionConfig, SqliteGraphStore};
use tracing::info;

/// Vector length of the offline embedder.
const OFFLINE_DIMS: usize = 256;

/// Strata memory engine.
#[derive(Parser, Debug)]
#[command(name = "strata", about = "Layered long-term memory engine")]
struct Cli {
    /// Settings file (defaults to `~/.strata/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Use deterministic local embeddings and skip the chat provider.
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,

    /// Log one JSON object per line.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a text file (or `-` for stdin) into a layer.
    Ingest {
        /// Input path.
        path: PathBuf,
        /// Target layer.
        #[arg(long, default_value = "knowledge")]
        layer: Layer,
        /// Source label stored with each episode.
        #[arg(long, default_value = "uploaded_text")]
        source: String,
        /// Author.
        #[arg(long)]
        user: Option<String>,
    },
    /// Fused search over the graph.
    Search {
        /// Query text.
        query: String,
        /// Restrict to these layers (repeatable).
        #[arg(long = "layer")]
        layers: Vec<Layer>,
        /// Results per collection.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Build prompt context for a query.
    Context {
        /// Query text.
        query: String,
        /// Restrict to these layers (repeatable).
        #[arg(long = "layer")]
        layers: Vec<Layer>,
        /// Token budget (defaults to settings).
        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Record one user/assistant exchange.
    ChatTurn {
        /// Speaker.
        #[arg(long)]
        user: String,
        /// Conversation id (defaults to the user's buffered conversation).
        #[arg(long)]
        conversation: Option<String>,
        /// User message.
        #[arg(long)]
        message: String,
        /// Assistant reply.
        #[arg(long)]
        reply: String,
    },
    /// Normalize entity names and bridge matching entities across layers.
    BackfillBridges {
        /// Entities read per page.
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// Also bridge by embedding similarity.
        #[arg(long, default_value_t = false)]
        use_embeddings: bool,
    },
    /// Merge same-name entities within each layer.
    Dedupe {
        /// Entities read per page.
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// Only report duplicates.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Embedding cache counters.
    CacheStats,
}

fn load_settings(cli: &Cli) -> Result<StrataSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(strata_settings::settings_path);
    let mut settings = strata_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db_path) = &cli.db_path {
        settings.store.path.clone_from(db_path);
    }
    Ok(settings)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_engine(settings: StrataSettings, offline: bool) -> Result<MemoryEngine> {
    ensure_parent_dir(&settings.store.path)?;
    let config = ConnectionConfig {
        pool_size: settings.store.pool_size,
        busy_timeout_ms: settings.store.busy_timeout_ms,
        ..ConnectionConfig::default()
    };
    let store = Arc::new(
        SqliteGraphStore::open(&settings.store.path, &config).context("Failed to open database")?,
    );

    let extractor = Arc::new(
        HttpExtractionClient::new(
            settings.extraction.base_url.clone(),
            Duration::from_millis(settings.extraction.timeout_ms),
        )
        .context("Failed to build extraction client")?,
    );

    let embedder: Arc<dyn EmbeddingProvider>;
    let chat: Option<Arc<dyn ChatProvider>>;
    if offline || settings.provider.api_key.is_none() {
        info!("using offline embeddings, summaries fall back to placeholders");
        embedder = Arc::new(HashEmbedder::new(OFFLINE_DIMS));
        chat = None;
    } else {
        let client = Arc::new(
            OpenAiClient::new(
                OpenAiConfig::from_settings(&settings.provider),
                settings.retry.clone(),
            )
            .context("Failed to build provider client")?,
        );
        embedder = client.clone();
        chat = Some(client);
    }

    Ok(MemoryEngine::new(
        settings,
        EngineParts {
            store,
            extractor,
            embedder,
            chat,
        },
    ))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("Failed to read stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(engine: &MemoryEngine, command: Command, default_tokens: usize) -> Result<()> {
    match command {
        Command::Ingest {
            path,
            layer,
            source,
            user,
        } => {
            let text = read_input(&path)?;
            let mut request = IngestRequest::new(text, layer)
                .source(source)
                .kind(EpisodeKind::Document);
            if let Some(user) = user {
                request = request.author(UserId::from(user.as_str()));
            }
            let outcome = engine.ingest(request).await?;
            print_json(&outcome)?;
        }
        Command::Search {
            query,
            layers,
            limit,
        } => {
            if query.trim().is_empty() {
                bail!("query is empty");
            }
            let result = engine
                .search(&SearchQuery::new(query, limit).layers(layers))
                .await?;
            print_json(&result)?;
        }
        Command::Context {
            query,
            layers,
            max_tokens,
        } => {
            let ctx = engine
                .build_context(&query, &layers, max_tokens.unwrap_or(default_tokens))
                .await?;
            println!("{}", ctx.text);
            eprintln!(
                "{}",
                json!({"tokenEstimate": ctx.token_estimate, "truncated": ctx.truncated, "sections": ctx.sections})
            );
        }
        Command::ChatTurn {
            user,
            conversation,
            message,
            reply,
        } => {
            let receipt = engine
                .record_turn(ChatTurn {
                    user: UserId::from(user.as_str()),
                    conversation: conversation.as_deref().map(ConversationId::from),
                    user_message: message,
                    assistant_message: reply,
                })
                .await?;
            print_json(&receipt)?;
        }
        Command::BackfillBridges {
            batch_size,
            use_embeddings,
        } => {
            let stats = engine
                .linker()
                .backfill_bridges(batch_size, use_embeddings)
                .await?;
            print_json(&stats)?;
        }
        Command::Dedupe {
            batch_size,
            dry_run,
        } => {
            let stats = engine.linker().dedupe_entities(batch_size, dry_run).await?;
            print_json(&stats)?;
        }
        Command::CacheStats => print_json(&engine.cache_stats())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let level = settings.log_level.0.clone();
    if cli.json_logs {
        strata_core::logging::init_json_subscriber(&level);
    } else {
        strata_core::logging::init_subscriber(&level);
    }

    let default_tokens = settings.context.max_tokens;
    let engine = build_engine(settings, cli.offline)?;
    let result = run(&engine, cli.command, default_tokens).await;
    // Background turn jobs must finish before the process exits.
    engine.shutdown().await;
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
