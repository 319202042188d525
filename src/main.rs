//! # HTS Harness CLI (`hts`)
//!
//! ## Usage
//!
//! ```bash
//! hts --config ./config/hts.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hts init` | Create the SQLite database and run schema migrations |
//! | `hts ingest <paths>` | Ingest JSON/JSONL source records |
//! | `hts embed pending` | Embed chunks that have no vector yet |
//! | `hts embed rebuild` | Drop and regenerate all embeddings |
//! | `hts search "<query>"` | Fused retrieval without generation |
//! | `hts classify "<query>"` | Guardrailed classification |
//! | `hts get <doc_id>` | Show a document, its chunks and revisions |
//! | `hts delete <doc_id>` | Remove a document |
//! | `hts stats` | Database and token usage summary |
//! | `hts eval <golden.jsonl>` | Hit rates and abstain rate over a golden set |
//! | `hts serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hts_harness::{
    classify, config, embed_cmd, eval, get, ingest, migrate, search, server, stats,
};
use hts_harness_core::ingest::ConflictPolicy;

/// HTS Harness: evidence-grounded HTSUS classification.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hts.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hts",
    about = "HTS Harness: hybrid retrieval and evidence-grounded guardrails for tariff classification",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hts.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest source records from JSON or JSONL files.
    ///
    /// Directories are walked for `.json` and `.jsonl` files. A record whose
    /// text changed under an existing `doc_id` is a version conflict unless
    /// `--on-conflict revise` is given.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// `reject` or `revise`; overrides `[ingest].on_conflict`.
        #[arg(long)]
        on_conflict: Option<ConflictPolicy>,

        /// Parse and count records without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage chunk embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Fused lexical + semantic search over the indexed chunks.
    Search {
        query: String,

        /// Number of results (capped at `retrieval.max_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Semantic weight in [0, 1].
        #[arg(long)]
        alpha: Option<f64>,

        /// Show per-stream scores.
        #[arg(long)]
        explain: bool,

        #[arg(long)]
        json: bool,
    },

    /// Classify a product description. Answers with cited HTS codes or abstains.
    Classify {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        alpha: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Show a stored document by `doc_id`.
    Get {
        doc_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete a document with its chunks and revisions.
    Delete { doc_id: String },

    /// Show database statistics and token usage.
    Stats,

    /// Evaluate against a golden set (JSONL of `{query, expected_code}`).
    Eval {
        golden: PathBuf,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that have no vector yet.
    Pending {
        /// Maximum number of chunks to embed.
        #[arg(long)]
        limit: Option<usize>,

        /// Override `[embedding].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only count pending chunks.
        #[arg(long)]
        dry_run: bool,
    },
    /// Drop every vector and embed all chunks again.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            paths,
            on_conflict,
            dry_run,
        } => {
            ingest::run_ingest(&cfg, &paths, on_conflict, dry_run).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Search {
            query,
            top_k,
            alpha,
            explain,
            json,
        } => {
            search::run_search(&cfg, &query, top_k, alpha, explain, json).await?;
        }
        Commands::Classify {
            query,
            top_k,
            alpha,
            json,
        } => {
            classify::run_classify(&cfg, &query, top_k, alpha, json).await?;
        }
        Commands::Get { doc_id, json } => {
            get::run_get(&cfg, &doc_id, json).await?;
        }
        Commands::Delete { doc_id } => {
            get::run_delete(&cfg, &doc_id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Eval { golden, top_k, json } => {
            eval::run_eval(&cfg, &golden, top_k, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
