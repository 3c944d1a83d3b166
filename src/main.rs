//! CodeRAG binary — thin CLI shell over the [`coderag`] library crate.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use coderag::query::SearchOptions;
use coderag::{start_watcher, Indexer, IndexerConfig};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Local hybrid code search: chunk-level BM25 index with live incremental updates.
#[derive(Parser)]
#[command(name = "coderag", version, about, long_about = None)]
struct Cli {
    /// Codebase root directory (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or update the index
    Index {
        /// Keep running and live-update the index on file changes
        #[arg(long)]
        watch: bool,
    },
    /// Search the index
    Search {
        /// Free-text query
        query: String,

        /// Maximum results
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Only files with this extension (repeatable)
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Only paths containing this substring
        #[arg(long)]
        path: Option<String>,

        /// Drop paths containing this substring (repeatable)
        #[arg(long = "exclude")]
        excludes: Vec<String>,

        /// Emit raw JSON instead of readable output
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics
    Stats,
    /// Delete the index for this codebase
    Clear,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coderag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> coderag::Result<()> {
    let root = cli.root.unwrap_or_else(|| PathBuf::from("."));
    let config = IndexerConfig::new(root).load_overrides()?;

    match cli.command {
        Commands::Index { watch } => {
            let watch = watch || config.watch;
            let indexer = Arc::new(Indexer::open(config)?);
            let report = indexer.index()?;
            println!(
                "indexed: {} added, {} changed, {} deleted, {} unchanged ({} chunks, {} ms)",
                report.added,
                report.changed,
                report.deleted,
                report.unchanged,
                report.chunks_indexed,
                report.duration_ms
            );
            if watch {
                let mut watcher = start_watcher(
                    Arc::clone(&indexer),
                    Some(Box::new(|path| println!("updated: {path}"))),
                )?;
                println!("watching for changes, ctrl-c to stop");
                tokio::signal::ctrl_c()
                    .await
                    .map_err(|e| coderag::Error::Watcher(e.to_string()))?;
                watcher.stop();
                indexer.close();
            }
        }
        Commands::Search { query, limit, extensions, path, excludes, json } => {
            let indexer = Indexer::open(config)?;
            let opts = SearchOptions {
                limit,
                file_extensions: extensions,
                path_substring: path,
                exclude_path_substrings: excludes,
                ..Default::default()
            };
            let results = indexer.search(&query, &opts)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&results)
                        .unwrap_or_else(|_| "[]".to_string())
                );
            } else if results.is_empty() {
                println!("no results");
            } else {
                for r in &results {
                    println!(
                        "{}:{}-{}  [{}]  score {:.3}",
                        r.path, r.start_line, r.end_line, r.kind, r.score
                    );
                    if let Some(snippet) = &r.snippet {
                        for line in snippet.lines().take(8) {
                            println!("    {line}");
                        }
                    }
                    println!();
                }
            }
        }
        Commands::Stats => {
            let indexer = Indexer::open(config)?;
            let stats = indexer.stats()?;
            println!("files:   {}", stats.files);
            println!("chunks:  {}", stats.chunks);
            println!("terms:   {}", stats.terms);
            println!("avg len: {:.1}", stats.avg_doc_length);
        }
        Commands::Clear => {
            let indexer = Indexer::open(config)?;
            indexer.clear()?;
            println!("index cleared");
        }
    }
    Ok(())
}
