mod config;
mod dns;
mod domains;
mod evaluator;
mod metrics;
mod probe;
mod proxy;
mod registry;
mod resolver;
mod scheduler;
mod web;

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::proxy::server::ProxyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xproxy=info".into()),
        )
        .init();

    info!("xproxy v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "xproxy.toml".to_string());

    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);

    let server = ProxyServer::bind(Arc::new(config)).await?;
    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.stop();
    server.join().await;

    Ok(())
}
