mod server;

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use confab_core::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (file path from argv or CONFAB_CONFIG, both optional)
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFAB_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("confab server starting");
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Listen address"
    );

    if config.auth.jwt_secret.is_empty() {
        anyhow::bail!("JWT_SECRET must be configured");
    }

    // 3. Build and run everything else
    server::run(config).await
}
