// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Depth engine --------
pub static DEPTH_FRAMES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("depth_frames_total", "feature frames published").unwrap());

pub static DEPTH_RESYNCS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("depth_resyncs_total", "book sessions aborted pending re-snapshot").unwrap()
});

pub static DEPTH_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("depth_dropped_total", "malformed depth frames dropped").unwrap());

pub static DEPTH_PROCESS_TIME: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("depth_process_seconds", "book update + publish time").buckets(vec![
            1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 5e-3, 1e-2,
        ]),
    )
    .unwrap()
});

// -------- Decision relay --------
pub static RELAY_FRAMES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("relay_frames_total", "feature frames consumed").unwrap());

pub static RELAY_DECISIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("relay_decisions_total", "policy decisions made").unwrap());

pub static RELAY_ACTIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("relay_actions_total", "action frames published").unwrap());

pub static RELAY_TRADES_OBSERVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("relay_trades_observed_total", "closed trades handed to the policy").unwrap()
});

// -------- Lifecycle engine --------
pub static ORDERS_SUBMITTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_submitted_total", "orders sent to the exchange").unwrap());

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_rejected_total", "orders dropped before submission"),
        &["reason"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "recognised fill deltas"), &["side"]).unwrap()
});

pub static UNKNOWN_FILLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("unknown_fills_total", "fills for exchange ids we never tracked").unwrap()
});

pub static EXEC_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("execution_reports_total", "execution reports published"),
        &["kind"],
    )
    .unwrap()
});

pub static TRADES_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_closed_total", "trades driven back to flat").unwrap());

pub static LAST_REWARD: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("last_trade_reward", "reward of the last closed trade").unwrap());

pub static MAXDD: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("position_maxdd", "worst unrealised PnL ratio of the open trade").unwrap()
});

pub static BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("account_balance", "last reported cash balance (USDT)").unwrap());

pub static CANCELS_SENT: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cancels_sent_total", "cancel requests sent").unwrap());

// -------- Shared transport health --------
pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "websocket reconnect attempts"),
        &["endpoint"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(DEPTH_FRAMES.clone())),
        REGISTRY.register(Box::new(DEPTH_RESYNCS.clone())),
        REGISTRY.register(Box::new(DEPTH_DROPPED.clone())),
        REGISTRY.register(Box::new(DEPTH_PROCESS_TIME.clone())),
        REGISTRY.register(Box::new(RELAY_FRAMES.clone())),
        REGISTRY.register(Box::new(RELAY_DECISIONS.clone())),
        REGISTRY.register(Box::new(RELAY_ACTIONS.clone())),
        REGISTRY.register(Box::new(RELAY_TRADES_OBSERVED.clone())),
        REGISTRY.register(Box::new(ORDERS_SUBMITTED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(UNKNOWN_FILLS.clone())),
        REGISTRY.register(Box::new(EXEC_REPORTS.clone())),
        REGISTRY.register(Box::new(TRADES_CLOSED.clone())),
        REGISTRY.register(Box::new(LAST_REWARD.clone())),
        REGISTRY.register(Box::new(MAXDD.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(CANCELS_SENT.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
    ] {
        let _ = m;
    }
}

/// Current registry contents in Prometheus text format.
fn render_metrics() -> Vec<u8> {
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut body) {
        warn!(?e, "metrics encode failed");
    }
    if body.is_empty() {
        body = b"# no metrics\n".to_vec();
    }
    body
}

/// Answer one scrape. The reply is identical for every path, so the
/// request itself is drained with a single read and otherwise ignored.
fn respond(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request)?;

    let body = render_metrics();
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    stream.write_all(&response)?;
    stream.flush()
}

/// Scrape endpoint on a dedicated OS thread, off the tokio runtime.
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, port, "metrics listener failed to bind");
                return;
            }
        };
        info!(port, "metrics endpoint up");

        loop {
            match listener.accept() {
                Ok((mut stream, _peer)) => {
                    if let Err(e) = respond(&mut stream) {
                        warn!(?e, "metrics scrape failed");
                    }
                }
                Err(e) => warn!(?e, "metrics accept error"),
            }
        }
    });
}
