// ===============================
// src/depth.rs
// ===============================
//
// Depth engine service loop: consume the public depth stream, keep the
// dense book current, and emit one feature frame per successful update
// under a rolling 16-bit sequence id. A level-count violation aborts the
// session; reconnecting forces a fresh snapshot and restarts the
// sequence at zero.

use std::collections::VecDeque;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use lapin::Channel;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::book::{parse_level, BookFeatures, BookLevel, DepthBook};
use crate::broker::{self, ORDERBOOK_EXCHANGE, ORDERBOOK_ROUTING_KEY};
use crate::codec::{
    encode_change_value, encode_orderbook_value, CENTS_MULTIPLIER, FEATURE_FRAME_SIZE, NUM_DEPTHS,
};
use crate::config::DepthConfig;
use crate::metrics::{DEPTH_DROPPED, DEPTH_FRAMES, DEPTH_PROCESS_TIME, DEPTH_RESYNCS, WS_RECONNECTS};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const KEEPALIVE_SECS: u64 = 25;
/// Frames per rolling processing-time log line.
const TIMING_WINDOW: usize = 100;

#[derive(Debug, Deserialize)]
struct DepthFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Option<Vec<DepthData>>,
}

#[derive(Debug, Deserialize)]
struct DepthData {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
}

fn parse_side(rows: &[Vec<String>]) -> Vec<BookLevel> {
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_level(row) {
            Some(level) => levels.push(level),
            None => warn!(?row, "invalid price level format"),
        }
    }
    levels
}

/// Serialize the book and its derived features into one wire frame.
pub fn encode_frame(book: &DepthBook, features: &BookFeatures, sequence_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FEATURE_FRAME_SIZE);
    for level in book.bids() {
        buf.extend_from_slice(&encode_change_value(level.price).to_le_bytes());
        buf.extend_from_slice(&encode_orderbook_value(level.volume).to_le_bytes());
        buf.extend_from_slice(&encode_orderbook_value(level.orders).to_le_bytes());
    }
    for level in book.asks() {
        buf.extend_from_slice(&encode_change_value(level.price).to_le_bytes());
        buf.extend_from_slice(&encode_orderbook_value(level.volume).to_le_bytes());
        buf.extend_from_slice(&encode_orderbook_value(level.orders).to_le_bytes());
    }

    // The mid carried in the feature block is change-encoded for wire
    // parity; the trustworthy absolute mid follows in cents.
    buf.extend_from_slice(&encode_change_value(features.mid_price).to_le_bytes());
    for d in 0..NUM_DEPTHS {
        buf.extend_from_slice(&encode_change_value(features.volume_imbalance[d]).to_le_bytes());
        buf.extend_from_slice(&encode_change_value(features.order_imbalance[d]).to_le_bytes());
        buf.extend_from_slice(&encode_change_value(features.bid_vwap_disp[d]).to_le_bytes());
        buf.extend_from_slice(&encode_change_value(features.ask_vwap_disp[d]).to_le_bytes());
    }

    let mid_cents = (features.mid_price * CENTS_MULTIPLIER) as u32;
    buf.extend_from_slice(&mid_cents.to_le_bytes());
    buf.extend_from_slice(&sequence_id.to_le_bytes());
    buf
}

fn subscribe_message(instrument: &str) -> String {
    json!({
        "op": "subscribe",
        "args": [{"channel": "books", "instId": instrument}]
    })
    .to_string()
}

struct TimingLog {
    window: VecDeque<f64>,
    total: u64,
}

impl TimingLog {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(TIMING_WINDOW),
            total: 0,
        }
    }

    fn observe(&mut self, seconds: f64, sequence_id: u16) {
        DEPTH_PROCESS_TIME.observe(seconds);
        if self.window.len() == TIMING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(seconds);
        self.total += 1;
        if self.total % TIMING_WINDOW as u64 == 0 && self.window.len() == TIMING_WINDOW {
            let avg_us =
                self.window.iter().sum::<f64>() / self.window.len() as f64 * 1_000_000.0;
            info!(avg_us = format!("{avg_us:.1}"), sequence_id, "frame processing time");
        }
    }
}

pub async fn run(cfg: DepthConfig, channel: Channel) -> anyhow::Result<()> {
    let mut timing = TimingLog::new();

    loop {
        info!(url = %cfg.public_ws_url, instrument = %cfg.instrument, "connecting depth stream");
        let ws = match connect_async(cfg.public_ws_url.as_str()).await {
            Ok((ws, _resp)) => ws,
            Err(e) => {
                error!(?e, "depth stream connect failed");
                WS_RECONNECTS.with_label_values(&["okx-public"]).inc();
                sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        let (mut write, mut read) = ws.split();

        if let Err(e) = write
            .send(Message::Text(subscribe_message(&cfg.instrument)))
            .await
        {
            error!(?e, "depth subscribe failed");
            WS_RECONNECTS.with_label_values(&["okx-public"]).inc();
            sleep(RECONNECT_BACKOFF).await;
            continue;
        }

        // Fresh session: the book rebuilds from the next snapshot and the
        // sequence restarts.
        let mut book = DepthBook::new();
        let mut sequence_id: u16 = 0;
        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_SECS));

        'session: loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(m)) if m.is_text() => match m.into_text() {
                            Ok(t) => t,
                            Err(_) => continue,
                        },
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(?e, "depth stream read error");
                            break 'session;
                        }
                        None => {
                            warn!("depth stream closed");
                            break 'session;
                        }
                    };
                    if text == "pong" {
                        continue;
                    }

                    let start = Instant::now();
                    let parsed: DepthFrame = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(?e, "malformed depth frame, dropping");
                            DEPTH_DROPPED.inc();
                            continue;
                        }
                    };

                    if let Some(event) = parsed.event.as_deref() {
                        if event == "error" {
                            warn!(msg = ?parsed.msg, "depth stream error event");
                        } else {
                            info!(event, "depth stream event");
                        }
                        continue;
                    }

                    let (action, data) = match (parsed.action.as_deref(), parsed.data) {
                        (Some(action), Some(data)) if !data.is_empty() => (action.to_string(), data),
                        _ => continue,
                    };
                    let first = &data[0];
                    let bids = parse_side(&first.bids);
                    let asks = parse_side(&first.asks);

                    let applied = match action.as_str() {
                        "snapshot" => {
                            let result = book.apply_snapshot(bids.into_iter(), asks.into_iter());
                            if result.is_ok() {
                                // New snapshot, new sequence.
                                sequence_id = 0;
                            }
                            result
                        }
                        "update" => book.apply_update(bids.into_iter(), asks.into_iter()),
                        other => {
                            warn!(action = other, "unknown depth action");
                            continue;
                        }
                    };

                    match applied {
                        Ok(()) => {
                            let features = book.features();
                            let payload = encode_frame(&book, &features, sequence_id);
                            match broker::publish_binary(
                                &channel,
                                ORDERBOOK_EXCHANGE,
                                ORDERBOOK_ROUTING_KEY,
                                &payload,
                            )
                            .await
                            {
                                Ok(()) => DEPTH_FRAMES.inc(),
                                // The book is unaffected by a publish
                                // failure; the sequence still advances.
                                Err(e) => error!(?e, "frame publish failed"),
                            }
                            timing.observe(start.elapsed().as_secs_f64(), sequence_id);
                            sequence_id = sequence_id.wrapping_add(1);
                        }
                        Err(e) => {
                            // Invariant violation: the session is dead
                            // until a fresh snapshot arrives.
                            error!(%e, "book state invalid, forcing re-snapshot");
                            DEPTH_RESYNCS.inc();
                            break 'session;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                        error!(?e, "depth keepalive failed");
                        break 'session;
                    }
                }
            }
        }

        WS_RECONNECTS.with_label_values(&["okx-public"]).inc();
        sleep(RECONNECT_BACKOFF).await;
    }
}
