//! `nestling serve`: Start the HTTP API server.

use std::path::Path;

use nestling_gateway::Runtime;

pub async fn run(config_path: Option<&Path>, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = super::load_config(config_path)?;
    super::require_api_key(&config)?;

    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(host) = host {
        config.gateway.host = host;
    }

    println!("Nestling Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.provider.chat_model);
    println!("   Storage:   {}", config.storage.database);

    let runtime = Runtime::open(config).await?;
    nestling_gateway::serve(runtime)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
