use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bgdp_sync::{Pipeline, PipelineConfig, RunSummary};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bgdp")]
#[command(about = "Board game data pipeline")]
struct Cli {
    /// Optional YAML pipeline configuration; defaults apply otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover identifiers from the listing page and scrape the catalog.
    Catalog,
    /// Scrape name/description records for identifiers from the input CSV.
    Descriptions,
    /// Join a completed artifact against the attribute mapping tables.
    Simplify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml(path)?,
        None => PipelineConfig::default(),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("ctrl-c received, finishing current batch then stopping");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let pipeline = Pipeline::new(config)?;
    let summary = match cli.command {
        Commands::Catalog => pipeline.run_catalog(&cancel).await?,
        Commands::Descriptions => pipeline.run_descriptions(&cancel).await?,
        Commands::Simplify => pipeline.run_simplify()?,
    };
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} run {:?}: run_id={} records={} batches={} skipped={} output={}",
        summary.kind,
        summary.status,
        summary.run_id,
        summary.records_written,
        summary.batches_fetched,
        summary.batches_skipped,
        summary.output_path
    );
}
