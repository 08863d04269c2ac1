//! # Temporal Harness CLI (`tctx`)
//!
//! The `tctx` binary drives the temporal retrieval pipeline: database setup,
//! index building, time-aware search, evolution queries and batch runs.
//!
//! ## Usage
//!
//! ```bash
//! tctx --config ./config/tctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tctx init` | Create the SQLite database and run schema migrations |
//! | `tctx index build` | Extract timestamps, embed and index one chunking method |
//! | `tctx stats` | Timestamp extraction statistics |
//! | `tctx extract "<text>"` | Show the extractor's verdict for ad-hoc text |
//! | `tctx search "<query>"` | Single-pass temporally weighted search |
//! | `tctx evolve "<query>"` | Early vs late retrieval, optional synthesis |
//! | `tctx compare "<query>"` | Baseline vs temporal rankings side by side |
//! | `tctx batch` | Every corpus × system × query combination as JSON Lines |
//! | `tctx export` | Dump the temporal index as JSON |
//!
//! ## Examples
//!
//! ```bash
//! tctx init
//! tctx index build --input ./data/fixed_660 --chunking fixed_660
//! tctx evolve "How did the position on sanctions change?" --corpus UK
//! tctx search "budget deficit 2023" --method bm25 -k 5
//! tctx batch --queries queries.txt --system fixed_660:bm25 --output out.jsonl
//! ```

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use temporal_harness::batch::{self, BatchOptions, System};
use temporal_harness::query::{self, QueryOptions};
use temporal_harness::{config, export, ingest, migrate, stats};

/// Temporal Harness: time-aware retrieval for tracking how positions
/// evolve across a document corpus.
#[derive(Parser)]
#[command(
    name = "tctx",
    about = "Temporal Harness: time-aware retrieval over dated document chunks",
    version,
    long_about = "Temporal Harness attaches a publication date to every chunk of a corpus, \
    scores chunks lexically (BM25), densely (embeddings) or both, and retrieves the earliest \
    and latest relevant evidence so the evolution of a position can be traced."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tctx.toml")]
    config: PathBuf,

    /// Log at DEBUG instead of INFO (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; safe to run repeatedly.
    Init,

    /// Build and inspect similarity indexes.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Timestamp extraction statistics over the temporal index.
    Stats(StatsArgs),

    /// Run the timestamp extractor on ad-hoc text or a file.
    Extract {
        /// Text to inspect. Ignored when --file is given without it.
        text: Option<String>,

        /// Read the text from this file; its name is used as the filename hint.
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Single-pass search: type filter, year filter, recency decay, top-k.
    Search {
        query: String,

        #[command(flatten)]
        opts: QueryArgs,
    },

    /// Retrieve the earliest and latest relevant chunks for a query.
    Evolve {
        query: String,

        #[command(flatten)]
        opts: QueryArgs,

        /// Ask the synthesis provider to describe the evolution.
        #[arg(long)]
        synthesize: bool,
    },

    /// Compare baseline (similarity only) and temporal rankings.
    Compare {
        query: String,

        #[command(flatten)]
        opts: QueryArgs,
    },

    /// Run every corpus × system × query combination as JSON Lines.
    Batch {
        /// File with one query per line; `#` starts a comment line.
        #[arg(long)]
        queries: PathBuf,

        /// Corpus tag to run (repeatable). Defaults to `index.corpus_tags`.
        #[arg(long = "corpus")]
        corpora: Vec<String>,

        /// System as `<chunking>[:<embedding>]` (repeatable), e.g. `fixed_660:bm25`.
        #[arg(long = "system", required = true)]
        systems: Vec<System>,

        /// Write JSON Lines here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        synthesize: bool,

        /// Query date as YYYY-MM-DD (default: today).
        #[arg(long, value_parser = parse_date_arg)]
        as_of: Option<NaiveDate>,
    },

    /// Export temporal records as JSON.
    Export {
        /// Only export records of this chunking method.
        #[arg(long)]
        chunking: Option<String>,

        /// Output file (default: stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Load chunks, extract timestamps, embed, save the index and record
    /// timestamps in SQLite.
    Build {
        /// Chunk directory (`<doc>_chunks/*.txt`) or a `.jsonl` file.
        #[arg(long)]
        input: PathBuf,

        /// Chunking method label, e.g. `fixed_660` or `hierarchical`.
        #[arg(long)]
        chunking: String,

        /// Report counts and extraction statistics without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Same as `tctx stats`.
    Stats(StatsArgs),
}

#[derive(Args)]
struct StatsArgs {
    /// Only count records of this chunking method.
    #[arg(long)]
    chunking: Option<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct QueryArgs {
    /// Chunking method whose index is searched.
    #[arg(long, default_value = "fixed_660")]
    chunking: String,

    /// Only consider chunks tagged with this embedding method.
    #[arg(long)]
    embedding: Option<String>,

    /// Only consider chunks of this corpus tag (e.g. UK, US).
    #[arg(long)]
    corpus: Option<String>,

    /// Similarity method: `bm25`, `dense` or `hybrid` (default from config).
    #[arg(long)]
    method: Option<String>,

    /// Results per list.
    #[arg(short, long)]
    k: Option<usize>,

    /// Width of the early and late windows in months.
    #[arg(long)]
    months: Option<u32>,

    /// Query date as YYYY-MM-DD (default: today).
    #[arg(long, value_parser = parse_date_arg)]
    as_of: Option<NaiveDate>,

    #[arg(long)]
    json: bool,
}

impl QueryArgs {
    fn into_options(self) -> (QueryOptions, bool) {
        (
            QueryOptions {
                chunking_method: self.chunking,
                embedding_method: self.embedding,
                corpus: self.corpus,
                method: self.method,
                k: self.k,
                months: self.months,
                as_of: self.as_of,
            },
            self.json,
        )
    }
}

fn parse_date_arg(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{}' (expected YYYY-MM-DD): {}", s, e))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { action } => match action {
            IndexAction::Build {
                input,
                chunking,
                dry_run,
            } => {
                ingest::run_index_build(&cfg, &input, &chunking, dry_run).await?;
            }
            IndexAction::Stats(args) => {
                stats::run_stats(&cfg, args.chunking.as_deref(), args.json).await?;
            }
        },
        Commands::Stats(args) => {
            stats::run_stats(&cfg, args.chunking.as_deref(), args.json).await?;
        }
        Commands::Extract { text, file, json } => {
            query::run_extract(&cfg, text.as_deref(), file.as_deref(), json)?;
        }
        Commands::Search { query: q, opts } => {
            let (opts, json) = opts.into_options();
            query::run_search(&cfg, &q, &opts, json).await?;
        }
        Commands::Evolve {
            query: q,
            opts,
            synthesize,
        } => {
            let (opts, json) = opts.into_options();
            query::run_evolve(&cfg, &q, &opts, synthesize, json).await?;
        }
        Commands::Compare { query: q, opts } => {
            let (opts, json) = opts.into_options();
            query::run_compare(&cfg, &q, &opts, json).await?;
        }
        Commands::Batch {
            queries,
            corpora,
            systems,
            output,
            synthesize,
            as_of,
        } => {
            batch::run_batch(
                &cfg,
                BatchOptions {
                    queries: &queries,
                    corpora,
                    systems,
                    output: output.as_deref(),
                    synthesize,
                    as_of,
                },
            )
            .await?;
        }
        Commands::Export { chunking, output } => {
            export::run_export(&cfg, chunking.as_deref(), output.as_deref()).await?;
        }
    }

    Ok(())
}
