//! # medcorpus CLI
//!
//! Builds a searchable corpus of medical articles from remote archive
//! batches.
//!
//! ```bash
//! medcorpus --config ./config/medcorpus.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medcorpus fetch` | Download archive batches from the remote store |
//! | `medcorpus extract` | Unpack downloaded archives (one nested level) |
//! | `medcorpus process` | Transform XML documents into JSON records, in batches |
//! | `medcorpus load` | Register records in the corpus store and embed them |
//! | `medcorpus run` | fetch → extract → process → load |
//! | `medcorpus query "<text>"` | Similarity search over the loaded corpus |
//! | `medcorpus stats` | Show what each stage has produced |
//!
//! Diagnostics go to stderr through `tracing` (`RUST_LOG` overrides the
//! default `medcorpus=info`); command summaries go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use medcorpus::batch::{run_process, ProcessArgs};
use medcorpus::config::load_config;
use medcorpus::pipeline::{run_pipeline, RunArgs};
use medcorpus::progress::ProgressMode;
use medcorpus::{archive, fetch, load, query, stats};

#[derive(Parser)]
#[command(
    name = "medcorpus",
    about = "Fetch, extract, transform and load medical article archives into a vector corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medcorpus.toml")]
    config: PathBuf,

    /// Batch progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download archive batches not already present locally.
    Fetch {
        /// Download at most this many archives (in key order).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Unpack every downloaded archive into its own directory.
    Extract,

    /// Transform extracted XML documents into JSON records.
    Process {
        #[command(flatten)]
        batch: BatchFlags,
    },

    /// Register processed records in the corpus store.
    Load,

    /// Run every stage in order.
    Run {
        /// Download at most this many archives.
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        batch: BatchFlags,
    },

    /// Find the documents most similar to a piece of text.
    Query {
        text: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Show counts for every stage.
    Stats,
}

#[derive(clap::Args)]
struct BatchFlags {
    /// Documents per batch (overrides `processing.batch_size`).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent transforms (overrides `processing.workers`).
    #[arg(long)]
    workers: Option<usize>,

    /// Stop after this many batches.
    #[arg(long)]
    max_batches: Option<usize>,

    /// Skip documents whose record already exists.
    #[arg(long)]
    resume: bool,
}

impl BatchFlags {
    fn into_args(self, progress: Option<ProgressMode>) -> ProcessArgs {
        ProcessArgs {
            batch_size: self.batch_size,
            workers: self.workers,
            max_batches: self.max_batches,
            resume: self.resume,
            progress,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("medcorpus=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Fetch { limit } => {
            fetch::run_fetch(&cfg, limit).await?;
        }
        Commands::Extract => {
            archive::run_extract(&cfg)?;
        }
        Commands::Process { batch } => {
            run_process(&cfg, &batch.into_args(cli.progress)).await?;
        }
        Commands::Load => {
            load::run_load(&cfg).await?;
        }
        Commands::Run { limit, batch } => {
            let args = RunArgs {
                limit,
                process: batch.into_args(cli.progress),
            };
            run_pipeline(&cfg, &args).await?;
        }
        Commands::Query { text, limit } => {
            query::run_query(&cfg, &text, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
