//! azureapi server binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use azureapi::auth::token_cache;
use azureapi::identity::jwt::JwksValidator;
use azureapi::{server, AppState, Config};

/// How often expired exchanged tokens are dropped from the cache.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        // .env file is optional - only log if it's not a "file not found" error
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Refuse to serve with an incomplete configuration
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("\nPlease set the following environment variables:");
            eprintln!("  AZURE_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  AZURE_CLIENT_SECRET=<your-azure-ad-client-secret>");
            eprintln!("  AZURE_AUTHORITY=https://login.microsoftonline.com/<tenant-id>");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging.level);

    info!("Starting azureapi v{}", env!("CARGO_PKG_VERSION"));
    info!(
        authority = %config.azure_ad.authority,
        endpoint_version = ?config.azure_ad.endpoint_version,
        cache_enabled = config.token.cache_enabled,
        "Configuration loaded successfully"
    );

    let validator =
        Arc::new(JwksValidator::from_config(&config).context("Failed to create token validator")?);

    let state = match AppState::new(&config, validator) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize services: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(cache) = &state.token_cache {
        token_cache::spawn_purge_task(Arc::clone(cache), CACHE_PURGE_INTERVAL);
    }

    server::serve(&config.server.bind_address, server::router(state)).await?;

    info!("Server stopped");
    Ok(())
}

/// Initialize tracing/logging.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();
}
