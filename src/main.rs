//! Dwell CLI
//!
//! Runs the engine in plain mode: each stdin line is a visit event, the
//! literal `status` prints a snapshot. Without a remote client backend the
//! engine runs tracking-only.

use anyhow::Context;
use clap::Parser;
use dwell::{DomainResolver, Engine, EngineConfig, HttpFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Dwell - track attention per site and compute its payout distribution
#[derive(Parser, Debug)]
#[command(name = "dwell")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory for persisted engine state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// How many publishers the payout view considers
    #[arg(long)]
    top_n: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "dwell=debug" } else { "dwell=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_toml(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::new(default_data_dir()),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(top_n) = cli.top_n {
        config = config.with_top_publishers(top_n);
    }

    let engine = Engine::new(
        config,
        Arc::new(DomainResolver),
        Arc::new(HttpFetcher::new()?),
        None,
    )
    .await?;
    let handle = engine.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "status" => {
                let snapshot = handle.status().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            location => handle.visit(location).await,
        }
    }
    handle.shutdown().await;
    Ok(())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dwell")
}
