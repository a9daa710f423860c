//! Carrel CLI.
//!
//! A thin surface over the library for local use: create notebooks, ingest
//! extracted text files, ask questions, and check health. The HTTP layer,
//! UI, and document parsers live outside this crate.

// CLI output goes to stdout by design.
#![allow(clippy::print_stdout)]

use anyhow::Context;
use carrel::config::CoreConfig;
use carrel::core::SourceKind;
use carrel::service::Carrel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "carrel", version, about = "Local-first research assistant core")]
struct Cli {
    /// Data directory (defaults to the platform data dir).
    #[arg(long, env = "CARREL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and run the migration check.
    Init,
    /// Create a notebook.
    CreateNotebook {
        /// Notebook id.
        id: String,
        /// Display title.
        title: String,
    },
    /// Ingest an extracted-text file into a notebook.
    Ingest {
        /// Notebook id.
        notebook: String,
        /// Path to the extracted text file.
        file: PathBuf,
        /// Source kind (pdf, doc, web, spreadsheet, transcript, note, ...).
        #[arg(long, default_value = "note")]
        kind: String,
    },
    /// List sources in a notebook.
    Sources {
        /// Notebook id.
        notebook: String,
    },
    /// Run a stuck-source recovery sweep.
    Recover,
    /// Print retrieval health derived from recent metrics.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli
        .data_dir
        .map_or_else(CoreConfig::default, CoreConfig::new);

    let core = Carrel::open(config).await.context("failed to open core")?;

    match cli.command {
        Commands::Init => {
            println!("initialized at {}", core.config.data_dir.display());
            println!("migration: {:?}", core.migration_plan);
        }
        Commands::CreateNotebook { id, title } => {
            core.create_notebook(&id, &title).await?;
            println!("created notebook {id}");
        }
        Commands::Ingest {
            notebook,
            file,
            kind,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "input.txt".to_string());
            let kind = SourceKind::parse(&kind);

            let (source_id, report) = core
                .ingest_text(&notebook, &filename, &text, kind)
                .await?;
            println!(
                "ingested {source_id}: {} chunks from {} characters",
                report.chunks, report.characters
            );
        }
        Commands::Sources { notebook } => {
            for source in core.sources.list_for_notebook(&notebook).await {
                println!(
                    "{}  {:<12}  chunks={:<4}  tags=[{}]  {}",
                    source.id,
                    format!("{:?}", source.status).to_lowercase(),
                    source.chunk_count,
                    source.tags.join(","),
                    source.title,
                );
            }
        }
        Commands::Recover => {
            let report = core.recovery.check_and_recover().await;
            println!(
                "stuck={} recovered={} failed={}",
                report.stuck_found, report.recovered, report.failed
            );
            for action in report.actions {
                println!("  {} -> {} ({} chunks)", action.source_id, action.action, action.chunks);
            }
        }
        Commands::Health => {
            let health = core.metrics.health().await;
            println!("status: {:?}", health.status);
            println!("queries last hour: {}", health.queries_last_hour);
            println!("avg latency: {:.0}ms  p95: {:.0}ms", health.avg_latency_ms, health.p95_latency_ms);
            println!("error rate: {:.1}%", health.error_rate * 100.0);
            for issue in health.issues {
                println!("  issue: {issue}");
            }
        }
    }

    core.flush().await;
    Ok(())
}
