//! Nestling CLI: the main entry point.
//!
//! Commands:
//! - `serve`       : Start the HTTP gateway and the background index worker
//! - `ask`         : Ask a single question from the terminal
//! - `reindex`     : Reconcile the vector index with the stored details
//! - `ingest`      : Add a document to the shared knowledge corpus
//! - `init-config` : Write a default config file
//! - `doctor`      : Diagnose configuration and storage

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "nestling",
    about = "Nestling: a retrieval-augmented caregiver assistant",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.nestling/config.toml)
    #[arg(short, long, global = true, env = "NESTLING_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Ask a single question
    Ask(commands::ask::AskArgs),

    /// Re-index details whose index entry is missing or stale
    Reindex,

    /// Add a document to the shared knowledge corpus
    Ingest(commands::ingest::IngestArgs),

    /// Write a default config file
    InitConfig {
        /// Where to write it (defaults to ~/.nestling/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Diagnose configuration and storage
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(config_path, port, host).await?,
        Commands::Ask(args) => commands::ask::run(config_path, args).await?,
        Commands::Reindex => commands::reindex::run(config_path).await?,
        Commands::Ingest(args) => commands::ingest::run(config_path, args).await?,
        Commands::InitConfig { path, force } => commands::config_cmd::init(path, force)?,
        Commands::Doctor => commands::doctor::run(config_path).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
