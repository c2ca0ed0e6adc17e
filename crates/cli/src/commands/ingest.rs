//! `nestling ingest`: Add a document to the shared knowledge corpus.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use nestling_core::knowledge::AgeRange;
use nestling_gateway::Runtime;
use nestling_rag::{ContentType, SourceDocument};

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Document to ingest (.txt, .md, .html)
    pub file: PathBuf,

    /// Topic category, e.g. "sleep" or "nutrition"
    #[arg(long)]
    pub category: String,

    #[arg(long, default_value = "general")]
    pub topic: String,

    /// Source title or URL (defaults to the file name)
    #[arg(long)]
    pub source: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub min_months: u32,

    #[arg(long)]
    pub max_months: Option<u32>,

    /// Mark the content as reviewed by an expert
    #[arg(long)]
    pub reviewed: bool,
}

pub async fn run(config_path: Option<&Path>, args: IngestArgs) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    if config.storage.is_in_memory() {
        anyhow::bail!("ingest needs persistent storage; set storage.database to a SQLite path");
    }

    let content_type = ContentType::from_path(&args.file)
        .with_context(|| format!("Unrecognised document type: {}", args.file.display()))?;
    let bytes = std::fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let source = args.source.unwrap_or_else(|| {
        args.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let runtime = Runtime::open(config).await?;
    let result = runtime
        .services()
        .knowledge
        .ingest(SourceDocument {
            source: source.clone(),
            content_type,
            bytes,
            category: args.category,
            topic: args.topic,
            age_range: AgeRange {
                min_months: args.min_months,
                max_months: args.max_months,
            },
            expert_reviewed: args.reviewed,
        })
        .await;
    runtime.shutdown().await;

    let segments = result?;
    println!("Ingested '{source}' as {} segment(s)", segments.len());
    Ok(())
}
