use anyhow::Result;
use clap::Parser;
use sharded_throttler::config::Config;
use sharded_throttler::config_validator::ConfigValidator;
use sharded_throttler::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("sharded_throttler={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    ConfigValidator::validate_config(&config)
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing::info!("Starting sharded throttler");
    tracing::info!(
        bind_addr = %config.bind_addr,
        shards = ?config.endpoints(),
        capacity = config.default_capacity,
        period = %humantime::format_duration(config.default_refill_rate),
        algorithm = %config.default_algorithm(),
        "Configuration loaded"
    );

    let server = Server::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server.run().await
}
