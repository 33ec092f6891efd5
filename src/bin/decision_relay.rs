// ===============================
// src/bin/decision_relay.rs
// ===============================
use okx_mm_pipeline::policy::ImbalancePolicy;
use okx_mm_pipeline::{broker, config, metrics, relay};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let broker_cfg = config::BrokerConfig::from_env();
    let cfg = config::RelayConfig::from_env();

    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let conn = broker::connect(&broker_cfg).await?;
    let channel = broker::open_channel(&conn).await?;
    broker::declare_topology(&channel).await?;
    info!("decision relay starting");

    relay::run(channel, ImbalancePolicy::default()).await
}
