use clap::Parser;

use metrics_relay::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metrics_relay::init_tracing("metrics_relay=info");
    let config = AgentConfig::parse();

    let token = metrics_relay::cancel_on_signal();
    let summary = metrics_relay::agent::run(config, token).await?;
    if summary.failed > 0 {
        tracing::warn!(failed = summary.failed, "some deliveries did not land");
    }
    Ok(())
}
