// ===============================
// src/bin/lifecycle_engine.rs
// ===============================
use okx_mm_pipeline::{broker, config, lifecycle, metrics, okx};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let broker_cfg = config::BrokerConfig::from_env();
    let cfg = config::LifecycleConfig::from_env();
    // Missing exchange credentials abort startup.
    let creds = config::OkxCredentials::from_env()?;

    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let conn = broker::connect(&broker_cfg).await?;
    let channel = broker::open_channel(&conn).await?;
    broker::declare_topology(&channel).await?;

    let (client, events) = okx::spawn(creds, cfg.private_ws_url.clone(), cfg.instrument.clone());
    info!(instrument = %cfg.instrument, "lifecycle engine starting");

    lifecycle::run(cfg, channel, client, events).await
}
