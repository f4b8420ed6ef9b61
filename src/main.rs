//! # Anchor CLI (`anchor`)
//!
//! ## Usage
//!
//! ```bash
//! anchor --config ./config/anchor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `anchor init` | Create the SQLite database and run schema migrations |
//! | `anchor ingest` | Ingest files from the filesystem connector |
//! | `anchor search "<query>"` | Tag-walker search |
//! | `anchor context "<query>"` | Search and pack results into a character budget |
//! | `anchor get <id>` | Show one atom |
//! | `anchor quarantine <id>...` | Hide atoms from retrieval |
//! | `anchor stats` | Database statistics |
//! | `anchor completions <shell>` | Shell completion script |

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use anchor_core::models::Provenance;
use anchor_engine::ingest::IngestOptions;
use anchor_engine::progress::ProgressMode;
use anchor_engine::search::{SearchOptions, DEFAULT_BUDGET};
use anchor_engine::{config, get, ingest, logging, migrate, quarantine, search, stats};

/// Anchor: a local-first knowledge engine with deduplicating ingestion and
/// tag-walker retrieval.
#[derive(Parser)]
#[command(name = "anchor", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/anchor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest files from `[connectors.filesystem]`.
    ///
    /// Each file is segmented, deduplicated against the store and committed
    /// chunk by chunk. Failed chunks are reported; re-running fills them in.
    Ingest {
        /// Provenance for ingested content: `internal` or `external`.
        #[arg(long, value_parser = parse_provenance)]
        provenance: Option<Provenance>,

        /// Bucket to file content under (repeatable). Overrides the config.
        #[arg(long = "bucket")]
        buckets: Vec<String>,

        /// Tag applied to every atom (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Show file and molecule counts without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search ingested atoms.
    Search {
        query: String,

        /// Restrict to atoms in this bucket (repeatable, any-of).
        #[arg(long = "bucket")]
        buckets: Vec<String>,

        /// Restrict to atoms carrying this tag (repeatable, any-of).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Character budget for the result set.
        #[arg(long, default_value_t = DEFAULT_BUDGET)]
        budget: usize,

        /// Provenance filter. `quarantined` lists only quarantined atoms.
        #[arg(long, value_parser = parse_provenance)]
        provenance: Option<Provenance>,

        /// Expand each hit into a window of its source document.
        #[arg(long)]
        inflate: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search and pack the results into a context block.
    ///
    /// Packed text goes to stdout, stats to stderr.
    Context {
        query: String,

        #[arg(long = "bucket")]
        buckets: Vec<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value_t = DEFAULT_BUDGET)]
        budget: usize,

        /// Print text, stats and included atoms as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show an atom, its location and its variant links.
    Get { id: String },

    /// Hide atoms from retrieval without deleting them.
    Quarantine {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Recorded as an extra `quarantined:<reason>` tag.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show database statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Print a shell completion script.
    Completions { shell: clap_complete::Shell },
}

fn parse_provenance(s: &str) -> Result<Provenance, String> {
    s.parse().map_err(|e: anchor_core::AnchorError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "anchor", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level);
    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            provenance,
            buckets,
            tags,
            dry_run,
            limit,
            progress,
        } => {
            let options = IngestOptions {
                provenance,
                buckets,
                tags,
                dry_run,
                limit,
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_ingest(&cfg, &options, mode).await?;
        }
        Commands::Search {
            query,
            buckets,
            tags,
            budget,
            provenance,
            inflate,
            json,
        } => {
            let options = SearchOptions {
                buckets,
                tags,
                budget,
                provenance,
                inflate,
                json,
            };
            search::run_search(&cfg, &query, &options).await?;
        }
        Commands::Context {
            query,
            buckets,
            tags,
            budget,
            json,
        } => {
            let options = SearchOptions {
                buckets,
                tags,
                budget,
                json,
                ..Default::default()
            };
            search::run_context(&cfg, &query, &options).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Quarantine { ids, reason } => {
            quarantine::run_quarantine(&cfg, &ids, reason.as_deref()).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
