use tracing::info;

use cove::chat::config::Config;
use cove::chat::server::ChatServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(bus = ?config.bus, channel = %config.channel, "cove starting");

    let server = ChatServer::start(&config, config.bus.connect()).await?;
    info!(addr = %server.local_addr(), instance = server.instance(), "ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}
