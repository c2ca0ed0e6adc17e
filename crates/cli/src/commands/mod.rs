pub mod ask;
pub mod config_cmd;
pub mod doctor;
pub mod ingest;
pub mod reindex;
pub mod serve;

use anyhow::Context;
use nestling_config::AppConfig;
use std::path::Path;

/// Load from `path` if given, else the default location; env overrides and
/// validation apply either way.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let Some(path) = path else {
        return AppConfig::load().context("Failed to load config");
    };
    let mut config =
        AppConfig::load_from(path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Fail early, with setup instructions, when no API key is available.
pub fn require_api_key(config: &AppConfig) -> anyhow::Result<()> {
    if config.has_api_key() {
        return Ok(());
    }
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (recommended)");
    eprintln!("    NESTLING_API_KEY=sk-...");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
    anyhow::bail!("No API key found. See above for setup instructions.")
}
