//! `nestling reindex`: Reconcile the vector index with stored details.

use std::path::Path;

use nestling_gateway::Runtime;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    if config.storage.is_in_memory() {
        println!("Storage is in-memory; nothing persisted to reindex.");
        return Ok(());
    }

    let runtime = Runtime::open(config).await?;
    let report = runtime.reconcile_all().await;
    runtime.shutdown().await;
    let report = report?;

    println!("Reindex complete");
    println!("   Re-indexed: {}", report.reindexed);
    println!("   Removed:    {}", report.removed);
    println!("   Failed:     {}", report.failed);
    if report.failed > 0 {
        anyhow::bail!("{} detail(s) could not be indexed", report.failed);
    }
    Ok(())
}
