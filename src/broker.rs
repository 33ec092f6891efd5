// ===============================
// src/broker.rs
// ===============================
//
// RabbitMQ plumbing shared by the three services: topology declaration
// and persistent publishes. Every service declares the full topology on
// startup; declarations are idempotent so start order does not matter.

use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::info;

use crate::config::BrokerConfig;

pub const ORDERBOOK_EXCHANGE: &str = "orderbook";
pub const OMS_EXCHANGE: &str = "oms";
pub const EXECUTION_EXCHANGE: &str = "execution-exchange";

pub const ORDERBOOK_ROUTING_KEY: &str = "orderbook.updates";
pub const ACTION_ROUTING_KEY: &str = "oms.action";
pub const EXECUTION_ROUTING_KEY: &str = "execution.update";

pub const RELAY_FRAME_QUEUE: &str = "ppo_queue";
pub const RELAY_EXECUTION_QUEUE: &str = "ppo_execution_queue";
pub const ACTION_QUEUE: &str = "oms_action_queue";

const PERSISTENT: u8 = 2;

pub async fn connect(cfg: &BrokerConfig) -> lapin::Result<Connection> {
    let uri = cfg.amqp_uri();
    info!(host = %cfg.host, port = cfg.port, "connecting to broker");
    Connection::connect(&uri, ConnectionProperties::default()).await
}

pub async fn open_channel(conn: &Connection) -> lapin::Result<Channel> {
    conn.create_channel().await
}

/// Declare the three topic exchanges and the three durable queues with
/// their bindings.
pub async fn declare_topology(channel: &Channel) -> lapin::Result<()> {
    let exchange_opts = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    for exchange in [ORDERBOOK_EXCHANGE, OMS_EXCHANGE, EXECUTION_EXCHANGE] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                exchange_opts,
                FieldTable::default(),
            )
            .await?;
    }

    let queue_opts = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };
    let bindings = [
        (RELAY_FRAME_QUEUE, ORDERBOOK_EXCHANGE, ORDERBOOK_ROUTING_KEY),
        (RELAY_EXECUTION_QUEUE, EXECUTION_EXCHANGE, EXECUTION_ROUTING_KEY),
        (ACTION_QUEUE, OMS_EXCHANGE, ACTION_ROUTING_KEY),
    ];
    for (queue, exchange, routing_key) in bindings {
        channel
            .queue_declare(queue, queue_opts, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

pub async fn publish_binary(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> lapin::Result<()> {
    let props = BasicProperties::default()
        .with_content_type("application/octet-stream".into())
        .with_delivery_mode(PERSISTENT);
    channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, props)
        .await?;
    Ok(())
}

pub async fn publish_json(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> lapin::Result<()> {
    let props = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT);
    channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, props)
        .await?;
    Ok(())
}
