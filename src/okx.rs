// ===============================
// src/okx.rs
// ===============================
//
// Private OKX WebSocket client, modelled as an actor: one task owns the
// connection, takes commands over a channel and emits typed events on
// another. Nothing holds a pointer back into the caller.
//
// Fill updates rest in a timestamp-ordered buffer for a 2 second window
// before dispatch, absorbing out-of-order arrival on the private channel.
// All other events bypass the buffer.

use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::OkxCredentials;
use crate::domain::{OrderState, OrderType, Side};
use crate::metrics::WS_RECONNECTS;

/// Reorder window for fill updates. Going below 500 ms risks attributing
/// a late fill to an earlier state.
pub const BUFFER_WINDOW_MS: i64 = 2000;
const DRAIN_INTERVAL_MS: u64 = 100;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const MAX_RETRIES: u32 = 50;
const FILL_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone)]
pub enum OkxCommand {
    SubmitOrder {
        state_id: u16,
        side: Side,
        order_type: OrderType,
        size: f64,
        price: f64,
    },
    CancelOrder {
        exchange_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct FillEvent {
    pub exchange_id: String,
    pub cumulative_filled: f64,
    pub avg_price: f64,
    pub side: Side,
    pub state: OrderState,
    pub pnl: f64,
    pub fill_time: i64,
}

#[derive(Debug, Clone)]
pub enum OkxEvent {
    OrderAck { state_id: u16, exchange_id: String },
    OrderRejected { state_id: u16, reason: String },
    Fill(FillEvent),
    Balance { cash: f64 },
    Position { upl_ratio: f64 },
    CancelConfirmed { exchange_id: String },
}

#[derive(Clone)]
pub struct OkxClient {
    cmd_tx: mpsc::Sender<OkxCommand>,
}

impl OkxClient {
    pub async fn submit_order(
        &self,
        state_id: u16,
        side: Side,
        order_type: OrderType,
        size: f64,
        price: f64,
    ) {
        let cmd = OkxCommand::SubmitOrder { state_id, side, order_type, size, price };
        if self.cmd_tx.send(cmd).await.is_err() {
            error!("exchange client gone, order dropped");
        }
    }

    pub async fn cancel_order(&self, exchange_id: String) {
        if self
            .cmd_tx
            .send(OkxCommand::CancelOrder { exchange_id })
            .await
            .is_err()
        {
            error!("exchange client gone, cancel dropped");
        }
    }
}

/// Spawn the client task. Returns the command handle and the event stream.
pub fn spawn(
    creds: OkxCredentials,
    ws_url: String,
    instrument: String,
) -> (OkxClient, mpsc::Receiver<OkxEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<OkxCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<OkxEvent>(1024);
    tokio::spawn(client_task(creds, ws_url, instrument, cmd_rx, event_tx));
    (OkxClient { cmd_tx }, event_rx)
}

pub fn sign_request(secret: &str, timestamp: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}GET/users/self/verify").as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn login_message(creds: &OkxCredentials) -> String {
    let timestamp = format!("{:.3}", Utc::now().timestamp_millis() as f64 / 1000.0);
    let sign = sign_request(&creds.secret_key, &timestamp);
    json!({
        "op": "login",
        "args": [{
            "apiKey": creds.api_key,
            "passphrase": creds.passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }]
    })
    .to_string()
}

fn subscribe_message(channel: &str, instrument: &str) -> String {
    if channel == "account" {
        json!({"op": "subscribe", "args": [{"channel": "account", "ccy": "USDT"}]}).to_string()
    } else {
        json!({
            "op": "subscribe",
            "args": [{"channel": channel, "instType": "SWAP", "instId": instrument}]
        })
        .to_string()
    }
}

fn order_message(
    instrument: &str,
    state_id: u16,
    side: Side,
    order_type: OrderType,
    size: f64,
    price: f64,
) -> String {
    let mut args = json!({
        "instId": instrument,
        "tdMode": "cross",
        "side": side.as_str(),
        "ordType": order_type.as_str(),
        "sz": size.to_string(),
        "clOrdId": state_id.to_string(),
    });
    if order_type == OrderType::Limit {
        args["px"] = json!(price.to_string());
    }
    json!({"id": state_id.to_string(), "op": "order", "args": [args]}).to_string()
}

fn cancel_message(instrument: &str, exchange_id: &str) -> String {
    json!({
        "id": Utc::now().timestamp_millis().to_string(),
        "op": "cancel-order",
        "args": [{"instId": instrument, "ordId": exchange_id}]
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    arg: Option<ChannelArg>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChannelArg {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct OrderOpResult {
    #[serde(rename = "ordId", default)]
    ord_id: String,
    #[serde(rename = "clOrdId", default)]
    cl_ord_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct OrderUpdate {
    #[serde(rename = "ordId")]
    ord_id: String,
    #[serde(rename = "accFillSz", default)]
    acc_fill_sz: String,
    #[serde(rename = "avgPx", default)]
    avg_px: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    pnl: String,
    #[serde(rename = "fillTime", default)]
    fill_time: String,
    #[serde(rename = "uTime", default)]
    u_time: String,
    #[serde(rename = "cTime", default)]
    c_time: String,
}

impl OrderUpdate {
    fn timestamp(&self) -> i64 {
        for raw in [&self.fill_time, &self.u_time, &self.c_time] {
            if let Ok(ts) = raw.parse::<i64>() {
                return ts;
            }
        }
        Utc::now().timestamp_millis()
    }
}

/// Split off every buffered fill older than the reorder window; returned
/// in non-decreasing fill-time order.
fn take_matured(buffer: &mut Vec<FillEvent>, now_ms: i64) -> Vec<FillEvent> {
    buffer.sort_by_key(|f| f.fill_time);
    let split = buffer
        .iter()
        .position(|f| now_ms - f.fill_time <= BUFFER_WINDOW_MS)
        .unwrap_or(buffer.len());
    buffer.drain(..split).collect()
}

struct ClientState {
    last_cumulative: AHashMap<String, f64>,
    fill_buffer: Vec<FillEvent>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            last_cumulative: AHashMap::new(),
            fill_buffer: Vec::new(),
        }
    }

    /// Parse one inbound frame into events for the engine, buffering
    /// fills. Returns messages to send back (subscriptions after login).
    fn handle_text(
        &mut self,
        text: &str,
        instrument: &str,
        out_events: &mut Vec<OkxEvent>,
    ) -> Vec<String> {
        if text == "pong" {
            return Vec::new();
        }
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(?e, "unparseable private frame");
                return Vec::new();
            }
        };

        if let Some(event) = envelope.event.as_deref() {
            match event {
                "login" => {
                    if envelope.code.as_deref() == Some("0") {
                        info!("exchange login accepted, subscribing");
                        return vec![
                            subscribe_message("account", instrument),
                            subscribe_message("orders", instrument),
                            subscribe_message("positions", instrument),
                        ];
                    }
                    error!(msg = ?envelope.msg, "exchange login failed");
                }
                "error" => warn!(msg = ?envelope.msg, "exchange error frame"),
                other => debug!(event = other, "exchange event"),
            }
            return Vec::new();
        }

        match envelope.op.as_deref() {
            Some("order") => {
                self.handle_order_op(&envelope, out_events);
                return Vec::new();
            }
            Some("cancel-order") => {
                self.handle_cancel_op(&envelope, out_events);
                return Vec::new();
            }
            _ => {}
        }

        if let (Some(arg), Some(data)) = (&envelope.arg, &envelope.data) {
            match arg.channel.as_str() {
                "account" => self.handle_account(data, out_events),
                "orders" => self.handle_orders(data),
                "positions" => self.handle_positions(data, out_events),
                other => debug!(channel = other, "ignored channel"),
            }
        }
        Vec::new()
    }

    fn handle_order_op(&mut self, envelope: &Envelope, out_events: &mut Vec<OkxEvent>) {
        let results: Vec<OrderOpResult> = match envelope
            .data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
        {
            Some(r) => r,
            None => return,
        };
        for result in results {
            let state_id = match result.cl_ord_id.parse::<u16>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(cl_ord_id = %result.cl_ord_id, "order ack with foreign client id");
                    continue;
                }
            };
            let failed = envelope.code.as_deref().map(|c| c != "0").unwrap_or(false)
                || (!result.s_code.is_empty() && result.s_code != "0");
            if failed {
                out_events.push(OkxEvent::OrderRejected {
                    state_id,
                    reason: if result.s_msg.is_empty() {
                        envelope.msg.clone().unwrap_or_default()
                    } else {
                        result.s_msg
                    },
                });
            } else if !result.ord_id.is_empty() {
                out_events.push(OkxEvent::OrderAck {
                    state_id,
                    exchange_id: result.ord_id,
                });
            }
        }
    }

    fn handle_cancel_op(&mut self, envelope: &Envelope, out_events: &mut Vec<OkxEvent>) {
        if envelope.code.as_deref() != Some("0") {
            return;
        }
        let results: Vec<OrderOpResult> = match envelope
            .data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
        {
            Some(r) => r,
            None => return,
        };
        for result in results {
            if result.s_code == "0" && !result.ord_id.is_empty() {
                out_events.push(OkxEvent::CancelConfirmed {
                    exchange_id: result.ord_id,
                });
            }
        }
    }

    fn handle_account(&mut self, data: &serde_json::Value, out_events: &mut Vec<OkxEvent>) {
        let details = data
            .get(0)
            .and_then(|d| d.get("details"))
            .and_then(|d| d.get(0));
        if let Some(details) = details {
            let is_usdt = details.get("ccy").and_then(|c| c.as_str()) == Some("USDT");
            let cash = details
                .get("cashBal")
                .and_then(|b| b.as_str())
                .and_then(|s| s.parse::<f64>().ok());
            if let (true, Some(cash)) = (is_usdt, cash) {
                out_events.push(OkxEvent::Balance { cash });
            }
        }
    }

    fn handle_orders(&mut self, data: &serde_json::Value) {
        let updates: Vec<OrderUpdate> = match serde_json::from_value(data.clone()) {
            Ok(u) => u,
            Err(e) => {
                warn!(?e, "malformed order update");
                return;
            }
        };
        for update in updates {
            let cumulative = update.acc_fill_sz.parse::<f64>().unwrap_or(0.0);
            let prev = self
                .last_cumulative
                .get(&update.ord_id)
                .copied()
                .unwrap_or(0.0);
            if cumulative - prev <= FILL_EPSILON {
                continue;
            }
            let side = match Side::parse(&update.side) {
                Some(s) => s,
                None => {
                    warn!(ord_id = %update.ord_id, side = %update.side, "fill with unknown side");
                    continue;
                }
            };
            self.last_cumulative.insert(update.ord_id.clone(), cumulative);
            let fill = FillEvent {
                exchange_id: update.ord_id.clone(),
                cumulative_filled: cumulative,
                avg_price: update.avg_px.parse::<f64>().unwrap_or(0.0),
                side,
                state: OrderState::parse(&update.state),
                pnl: update.pnl.parse::<f64>().unwrap_or(0.0),
                fill_time: update.timestamp(),
            };
            self.fill_buffer.push(fill);
        }
    }

    fn handle_positions(&mut self, data: &serde_json::Value, out_events: &mut Vec<OkxEvent>) {
        let positions = match data.as_array() {
            Some(p) => p,
            None => return,
        };
        for position in positions {
            let upl_ratio = position
                .get("uplRatio")
                .and_then(|r| r.as_str())
                .and_then(|s| s.parse::<f64>().ok());
            if let Some(upl_ratio) = upl_ratio {
                out_events.push(OkxEvent::Position { upl_ratio });
            }
        }
    }
}

async fn client_task(
    creds: OkxCredentials,
    ws_url: String,
    instrument: String,
    mut cmd_rx: mpsc::Receiver<OkxCommand>,
    event_tx: mpsc::Sender<OkxEvent>,
) {
    let mut state = ClientState::new();
    let mut retries = 0u32;

    while retries < MAX_RETRIES {
        info!(%ws_url, "connecting private exchange socket");
        let ws = match connect_async(ws_url.as_str()).await {
            Ok((ws, _resp)) => ws,
            Err(e) => {
                error!(?e, "private socket connect failed");
                WS_RECONNECTS.with_label_values(&["okx-private"]).inc();
                retries += 1;
                sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        retries = 0;
        let (mut write, mut read) = ws.split();

        if let Err(e) = write.send(Message::Text(login_message(&creds))).await {
            error!(?e, "login send failed");
            WS_RECONNECTS.with_label_values(&["okx-private"]).inc();
            retries += 1;
            sleep(RECONNECT_BACKOFF).await;
            continue;
        }

        let mut drain = interval(Duration::from_millis(DRAIN_INTERVAL_MS));
        let mut keepalive = interval(Duration::from_secs(25));

        loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(m)) if m.is_text() => match m.into_text() {
                            Ok(t) => t,
                            Err(_) => continue,
                        },
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(?e, "private socket read error");
                            break;
                        }
                        None => {
                            warn!("private socket closed");
                            break;
                        }
                    };
                    let mut events = Vec::new();
                    let replies = state.handle_text(&text, &instrument, &mut events);
                    for event in events {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    for reply in replies {
                        if let Err(e) = write.send(Message::Text(reply)).await {
                            error!(?e, "private socket send failed");
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    let message = match cmd {
                        Some(OkxCommand::SubmitOrder { state_id, side, order_type, size, price }) => {
                            order_message(&instrument, state_id, side, order_type, size, price)
                        }
                        Some(OkxCommand::CancelOrder { exchange_id }) => {
                            cancel_message(&instrument, &exchange_id)
                        }
                        None => return,
                    };
                    if let Err(e) = write.send(Message::Text(message)).await {
                        error!(?e, "private socket send failed");
                    }
                }
                _ = drain.tick() => {
                    let matured = take_matured(&mut state.fill_buffer, Utc::now().timestamp_millis());
                    for fill in matured {
                        if event_tx.send(OkxEvent::Fill(fill)).await.is_err() {
                            return;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                        error!(?e, "keepalive send failed");
                    }
                }
            }
        }

        WS_RECONNECTS.with_label_values(&["okx-private"]).inc();
        retries += 1;
        sleep(RECONNECT_BACKOFF).await;
    }
    error!("private socket retry ceiling reached, client stopping");
}
