use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use metrics_relay::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metrics_relay::init_tracing("metrics_relay=info");
    let config = ServerConfig::parse();

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;

    let token = metrics_relay::cancel_on_signal();
    metrics_relay::server::run(config, listener, token).await
}
