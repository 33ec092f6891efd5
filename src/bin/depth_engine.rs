// ===============================
// src/bin/depth_engine.rs
// ===============================
use okx_mm_pipeline::{broker, config, depth, metrics};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let broker_cfg = config::BrokerConfig::from_env();
    let cfg = config::DepthConfig::from_env();

    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let conn = broker::connect(&broker_cfg).await?;
    let channel = broker::open_channel(&conn).await?;
    broker::declare_topology(&channel).await?;
    info!(instrument = %cfg.instrument, "depth engine starting");

    depth::run(cfg, channel).await
}
