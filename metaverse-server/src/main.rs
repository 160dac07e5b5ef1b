use anyhow::Result;
use tracing::info;

use metaverse_server::{load_config, logging, MetaverseServer};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Metaverse SFU server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Start the SFU and serve until shutdown
    let server = MetaverseServer::new(config).await?;
    server.start().await
}
