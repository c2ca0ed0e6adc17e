//! `nestling init-config`: Write a default configuration file.

use anyhow::Context;
use nestling_config::AppConfig;
use std::path::PathBuf;

pub fn init(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote default config to {}", path.display());
    println!();
    println!("  Next steps:");
    println!("    1. Set OPENROUTER_API_KEY (or provider.api_key in the file)");
    println!("    2. Point storage.database at a SQLite file to persist data");
    println!("    3. Run `nestling serve`");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_loadable_config_and_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init(Some(path.clone()), false).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, AppConfig::default().gateway.port);

        assert!(init(Some(path.clone()), false).is_err());
        init(Some(path), true).unwrap();
    }
}
