/// Relay backend - ingests relay reports and publishes route matrices
use relay_core::backend::load_relay_directory;
use relay_core::{Backend, Config, ROUTE_MATRIX_VERSION};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let directory = match &config.relay_directory {
        Some(path) => load_relay_directory(path)
            .map_err(|e| anyhow::anyhow!("Failed to load relay directory {}: {}", path.display(), e))?,
        None => Vec::new(),
    };

    info!("Starting relay backend");
    info!("   Route matrix version: {}", ROUTE_MATRIX_VERSION);
    if let Some(path) = &config.output_path {
        info!("   Output: {}", path.display());
    }

    let backend = Backend::with_directory(config, directory);
    backend.start().await
        .map_err(|e| anyhow::anyhow!("Backend error: {}", e))?;

    Ok(())
}
