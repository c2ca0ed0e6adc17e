//! `nestling doctor`: Diagnose configuration and storage.

use std::path::Path;

use nestling_config::{AppConfig, EmbeddingBackend};
use nestling_gateway::Backends;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Nestling Doctor");
    println!("===============\n");

    let mut issues = 0;

    let default_path = AppConfig::config_dir().join("config.toml");
    let shown = config_path.unwrap_or(&default_path);
    if !shown.exists() {
        println!("  ⚠️  No config file at {}: using defaults (`nestling init-config`)", shown.display());
    }

    let config = match super::load_config(config_path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e:#}");
            println!("\n  1 issue found.");
            return Ok(());
        }
    };

    if config.has_api_key() {
        println!("  ✅ API key configured");
    } else {
        println!("  ❌ No API key: set OPENROUTER_API_KEY or provider.api_key");
        issues += 1;
    }

    match config.provider.embedding_backend {
        EmbeddingBackend::Remote => println!("  ✅ Embeddings: {} (remote)", config.provider.embedding_model),
        EmbeddingBackend::Local => println!(
            "  ⚠️  Embeddings: local hashing ({} dims); retrieval quality is reduced",
            config.provider.local_dimensions
        ),
    }

    if config.storage.is_in_memory() {
        println!("  ⚠️  Storage is in-memory; details and history are lost on exit");
    } else if config.has_api_key() {
        match Backends::from_config(&config).await {
            Ok(_) => println!("  ✅ Storage opened: {}", config.storage.database),
            Err(e) => {
                println!("  ❌ Storage failed: {e}");
                issues += 1;
            }
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed!");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }
    Ok(())
}
