// ===============================
// src/lifecycle.rs
// ===============================
//
// Order-and-trade lifecycle engine. Owns the active-orders deque, the
// known-orders map, the current trade and a parked follow-on trade.
// Handlers are pure state transitions that return the reports to publish;
// the async service loop at the bottom wires them to the broker and the
// exchange client.
//
// Fill attribution: a fill delta against the prior net position splits
// into closing = min(delta, |prior_net|) and opening = delta - closing.
// The closing part belongs to the current trade; an opening part of at
// least MIN_OPENING starts a follow-on trade in the fill's direction.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::broker::{self, ACTION_QUEUE, EXECUTION_EXCHANGE, EXECUTION_ROUTING_KEY};
use crate::codec::ActionFrame;
use crate::config::LifecycleConfig;
use crate::domain::{
    FillPortion, OrderRecord, OrderState, OrderType, Side, Trade, TradeDirection,
};
use crate::metrics::{
    BALANCE, CANCELS_SENT, EXEC_REPORTS, FILLS, LAST_REWARD, MAXDD, ORDERS_REJECTED,
    ORDERS_SUBMITTED, TRADES_CLOSED, UNKNOWN_FILLS,
};
use crate::okx::{FillEvent, OkxClient, OkxEvent};
use crate::sizing::{OpenExposure, SizingPolicy};

/// Active-orders deque cap; overflow queues the oldest live order for cancel.
pub const MAX_ACTIVE_ORDERS: usize = 300;
/// A position with |net| below this is flat.
pub const SIZE_EPSILON: f64 = 1e-8;
/// Minimum opening portion that starts a follow-on trade.
pub const MIN_OPENING: f64 = 1e-3;
/// Bound on the at-most-once report guard (one full state-id cycle).
const PUBLISHED_CAP: usize = 1 << 16;

/// What the engine wants sent to the exchange for an accepted action.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub state_id: u16,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub price: f64,
}

/// Output alphabet of the fill state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// First recognised execution for a state id.
    Execution { state_id: u16, okx_id: String },
    /// Progress or split-portion execution with a known fraction in [0, 1].
    ExecutionFraction {
        state_id: u16,
        okx_id: String,
        fraction: f64,
    },
    /// Terminal report for a trade; portion values are percent in [0, 100].
    TradeClosure {
        filled_portions: Vec<(String, f64)>,
        reward: f64,
    },
}

impl Report {
    pub fn kind(&self) -> &'static str {
        match self {
            Report::Execution { .. } => "execution",
            Report::ExecutionFraction { .. } => "execution_fraction",
            Report::TradeClosure { .. } => "trade_closure",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Report::Execution { state_id, okx_id } => json!({
                "state_id": *state_id as u32,
                "okx_id": okx_id,
                "is_trade_closed": false,
            }),
            Report::ExecutionFraction { state_id, okx_id, fraction } => json!({
                "state_id": *state_id as u32,
                "okx_id": okx_id,
                "is_trade_closed": false,
                "execution_percentage": fraction,
            }),
            Report::TradeClosure { filled_portions, reward } => {
                let portions: Vec<serde_json::Value> = filled_portions
                    .iter()
                    .map(|(okx_id, pct)| json!({ okx_id.as_str(): pct }))
                    .collect();
                json!({
                    "is_trade_closed": true,
                    "filled_portions": portions,
                    "reward": reward,
                })
            }
        }
    }
}

/// At-most-once guard for plain execution reports, bounded to the last
/// full cycle of state ids.
struct PublishedIds {
    set: AHashSet<u16>,
    order: VecDeque<u16>,
}

impl PublishedIds {
    fn new() -> Self {
        Self {
            set: AHashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: u16) -> bool {
        self.set.contains(&id)
    }

    fn insert(&mut self, id: u16) {
        if self.set.insert(id) {
            self.order.push_back(id);
            if self.order.len() > PUBLISHED_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

struct CancelEntry {
    exchange_id: String,
    sent: bool,
}

/// Flat copy of the deque order used while attributing a fill.
#[derive(Clone)]
struct OrderSnapshot {
    local_id: u16,
    exchange_id: String,
    side: Side,
    intended_volume: f64,
    intended_price: f64,
    cumulative: f64,
    avg_price: f64,
    state: OrderState,
    fill_time: i64,
    execution_fraction: f64,
}

fn upsert_trade_order(trade: &mut Trade, snap: &OrderSnapshot, portion: FillPortion) {
    if let Some(order) = trade
        .orders
        .iter_mut()
        .find(|o| o.exchange_id.as_deref() == Some(snap.exchange_id.as_str()))
    {
        order.cumulative_filled = snap.cumulative;
        order.avg_fill_price = snap.avg_price;
        order.state = snap.state;
        order.fill_time = snap.fill_time;
        order.execution_fraction = snap.execution_fraction;
        order.fill_portions.push(portion);
    } else {
        let mut order = OrderRecord::new(
            snap.local_id,
            snap.side,
            snap.intended_volume,
            snap.intended_price,
        );
        order.exchange_id = Some(snap.exchange_id.clone());
        order.cumulative_filled = snap.cumulative;
        order.avg_fill_price = snap.avg_price;
        order.state = snap.state;
        order.fill_time = snap.fill_time;
        order.execution_fraction = snap.execution_fraction;
        order.trade_id = portion.trade_id.clone();
        order.fill_portions.push(portion);
        trade.orders.push(order);
    }
}

pub struct LifecycleEngine {
    sizing: SizingPolicy,
    leverage: f64,
    active_orders: VecDeque<OrderRecord>,
    known_orders: AHashMap<String, u16>,
    current_trade: Option<Trade>,
    next_trade: Option<Trade>,
    cancel_queue: VecDeque<CancelEntry>,
    published: PublishedIds,
    balance: f64,
    maxdd: f64,
}

impl LifecycleEngine {
    pub fn new(sizing: SizingPolicy, leverage: f64) -> Self {
        Self {
            sizing,
            leverage,
            active_orders: VecDeque::new(),
            known_orders: AHashMap::new(),
            current_trade: None,
            next_trade: None,
            cancel_queue: VecDeque::new(),
            published: PublishedIds::new(),
            balance: 0.0,
            maxdd: 0.0,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn net_position(&self) -> f64 {
        self.current_trade.as_ref().map(|t| t.net_size).unwrap_or(0.0)
    }

    pub fn on_balance(&mut self, cash: f64) {
        self.balance = cash;
        BALANCE.set(cash);
    }

    /// Worst unrealised PnL ratio while a trade is open. Monotone toward
    /// zero; only a strictly more negative value replaces it.
    pub fn on_position(&mut self, upl_ratio: f64) {
        if self.current_trade.is_some() && upl_ratio < 0.0 && upl_ratio < self.maxdd {
            self.maxdd = upl_ratio;
            MAXDD.set(upl_ratio);
        }
    }

    /// Decode an action into an order. Returns the exchange request, or
    /// None when the action is dropped (tiny size or policy rejection).
    pub fn on_action(&mut self, frame: &ActionFrame) -> Option<OrderRequest> {
        let mid = frame.mid_price;
        if mid <= 0.0 {
            warn!(state_id = frame.state_id, "action with zero mid, dropping");
            return None;
        }
        let order_price = mid * (1.0 + frame.price_offset / 1000.0);
        let side = if frame.price_offset < 0.0 { Side::Buy } else { Side::Sell };
        let order_type = if frame.kind == 0 { OrderType::Limit } else { OrderType::Market };
        let margin = self.balance * 0.001 * frame.volume_fraction;
        let size = (self.leverage * margin * 100.0 / order_price * 10.0).ceil() / 10.0;

        if size < self.sizing.min_contract {
            debug!(size, "size below contract minimum, ignoring action");
            return None;
        }

        let open: Vec<OpenExposure> = self
            .active_orders
            .iter()
            .filter(|o| !o.state.is_terminal())
            .map(|o| OpenExposure { side: o.side, intended_volume: o.intended_volume })
            .collect();
        let decision = match self.sizing.validate(
            size,
            side,
            self.balance,
            mid,
            self.current_trade.as_ref(),
            &open,
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!(%e, state_id = frame.state_id, "sizing policy rejected action");
                ORDERS_REJECTED.with_label_values(&["sizing"]).inc();
                return None;
            }
        };
        if decision.was_adjusted {
            info!(
                requested = size,
                adjusted = decision.size,
                "order size reduced to per-side cap"
            );
        }

        self.active_orders
            .push_back(OrderRecord::new(frame.state_id, side, decision.size, order_price));
        self.enforce_order_cap();

        Some(OrderRequest {
            state_id: frame.state_id,
            side,
            order_type,
            size: decision.size,
            price: order_price,
        })
    }

    pub fn on_order_ack(&mut self, state_id: u16, exchange_id: &str) {
        match self
            .active_orders
            .iter_mut()
            .find(|o| o.local_id == state_id && o.exchange_id.is_none())
        {
            Some(order) => {
                order.exchange_id = Some(exchange_id.to_string());
                order.state = OrderState::Live;
                self.known_orders.insert(exchange_id.to_string(), state_id);
                info!(state_id, %exchange_id, "order live");
            }
            None => warn!(state_id, %exchange_id, "ack for untracked order"),
        }
    }

    pub fn on_order_rejected(&mut self, state_id: u16, reason: &str) {
        warn!(state_id, %reason, "order rejected by exchange");
        ORDERS_REJECTED.with_label_values(&["exchange"]).inc();
        if let Some(i) = self
            .active_orders
            .iter()
            .position(|o| o.local_id == state_id && o.exchange_id.is_none())
        {
            self.active_orders.remove(i);
        }
    }

    pub fn on_cancel_confirmed(&mut self, exchange_id: &str) {
        self.cancel_queue.retain(|c| c.exchange_id != exchange_id);
    }

    /// One cancel request at a time; re-asking before confirmation yields
    /// nothing new.
    pub fn next_cancel(&mut self) -> Option<String> {
        for entry in self.cancel_queue.iter_mut() {
            if !entry.sent {
                entry.sent = true;
                return Some(entry.exchange_id.clone());
            }
        }
        None
    }

    pub fn handle_event(&mut self, event: OkxEvent) -> Vec<Report> {
        match event {
            OkxEvent::OrderAck { state_id, exchange_id } => {
                self.on_order_ack(state_id, &exchange_id);
                Vec::new()
            }
            OkxEvent::OrderRejected { state_id, reason } => {
                self.on_order_rejected(state_id, &reason);
                Vec::new()
            }
            OkxEvent::Fill(fill) => self.on_fill(&fill),
            OkxEvent::Balance { cash } => {
                self.on_balance(cash);
                Vec::new()
            }
            OkxEvent::Position { upl_ratio } => {
                self.on_position(upl_ratio);
                Vec::new()
            }
            OkxEvent::CancelConfirmed { exchange_id } => {
                self.on_cancel_confirmed(&exchange_id);
                Vec::new()
            }
        }
    }

    /// The core algorithm: recognise the fill, compute the delta, and map
    /// it onto the net-position model.
    pub fn on_fill(&mut self, fill: &FillEvent) -> Vec<Report> {
        let mut reports = Vec::new();

        // Recognition: an exchange id we never issued is ignored outright.
        let state_id = match self.known_orders.get(&fill.exchange_id).copied() {
            Some(id) => id,
            None => match self
                .active_orders
                .iter()
                .find(|o| o.exchange_id.as_deref() == Some(fill.exchange_id.as_str()))
            {
                Some(order) => {
                    let id = order.local_id;
                    self.known_orders.insert(fill.exchange_id.clone(), id);
                    id
                }
                None => {
                    warn!(exchange_id = %fill.exchange_id, "fill for unknown order, ignoring");
                    UNKNOWN_FILLS.inc();
                    return reports;
                }
            },
        };

        // A fill for a cancellation-queued order: restore it and void the
        // pending cancel.
        let in_deque = self
            .active_orders
            .iter()
            .any(|o| o.exchange_id.as_deref() == Some(fill.exchange_id.as_str()));
        if !in_deque {
            info!(exchange_id = %fill.exchange_id, "late fill for evicted order, restoring");
            self.cancel_queue.retain(|c| c.exchange_id != fill.exchange_id);
            let mut order = OrderRecord::new(
                state_id,
                fill.side,
                fill.cumulative_filled.max(self.sizing.min_contract),
                fill.avg_price,
            );
            order.exchange_id = Some(fill.exchange_id.clone());
            order.state = fill.state;
            order.fill_time = fill.fill_time;
            self.active_orders.push_back(order);
            self.active_orders
                .make_contiguous()
                .sort_by_key(|o| o.fill_time);
        }

        // Fill delta against this order's stored cumulative, then update
        // the order record in place.
        let (snap, delta) = {
            let order = match self
                .active_orders
                .iter_mut()
                .find(|o| o.exchange_id.as_deref() == Some(fill.exchange_id.as_str()))
            {
                Some(o) => o,
                None => return reports,
            };
            let delta = fill.cumulative_filled - order.cumulative_filled;
            if delta <= SIZE_EPSILON {
                debug!(exchange_id = %fill.exchange_id, "no new fill in update");
                return reports;
            }
            order.cumulative_filled = fill.cumulative_filled;
            order.avg_fill_price = fill.avg_price;
            order.state = fill.state;
            order.fill_time = fill.fill_time;
            order.execution_fraction = if fill.state == OrderState::Filled {
                1.0
            } else if order.intended_volume > 0.0 {
                (order.cumulative_filled / order.intended_volume).min(1.0)
            } else {
                0.0
            };
            let snap = OrderSnapshot {
                local_id: order.local_id,
                exchange_id: fill.exchange_id.clone(),
                side: order.side,
                intended_volume: order.intended_volume,
                intended_price: order.intended_price,
                cumulative: order.cumulative_filled,
                avg_price: order.avg_fill_price,
                state: order.state,
                fill_time: order.fill_time,
                execution_fraction: order.execution_fraction,
            };
            (snap, delta)
        };
        FILLS.with_label_values(&[fill.side.as_str()]).inc();

        match self.trade_relation(fill.side) {
            TradeRelation::Flat => self.open_trade(&snap, fill, delta, &mut reports),
            TradeRelation::SameDirection => {
                self.extend_trade(&snap, fill, delta, &mut reports)
            }
            TradeRelation::OppositeDirection => {
                self.reduce_or_flip_trade(&snap, fill, delta, &mut reports)
            }
        }

        self.retire_filled(&fill.exchange_id);
        self.enforce_order_cap();
        reports
    }

    fn trade_relation(&self, fill_side: Side) -> TradeRelation {
        match &self.current_trade {
            None => TradeRelation::Flat,
            Some(trade) => match trade.direction {
                Some(direction) if direction.entry_side() == fill_side => {
                    TradeRelation::SameDirection
                }
                _ => TradeRelation::OppositeDirection,
            },
        }
    }

    fn open_trade(
        &mut self,
        snap: &OrderSnapshot,
        fill: &FillEvent,
        delta: f64,
        reports: &mut Vec<Report>,
    ) {
        if delta <= SIZE_EPSILON {
            return;
        }
        let direction = TradeDirection::from_side(fill.side);
        let mut trade = Trade::open(fill.exchange_id.clone(), direction, delta);
        let fraction = if snap.intended_volume > 0.0 {
            (delta / snap.intended_volume).min(1.0)
        } else {
            0.0
        };
        let trade_id = trade.trade_id.clone();
        upsert_trade_order(
            &mut trade,
            snap,
            FillPortion {
                trade_id,
                size: delta,
                price: fill.avg_price,
                timestamp: fill.fill_time,
                is_closing: false,
                execution_fraction: fraction,
            },
        );
        trade.add_side_fill(fill.side, delta, fill.avg_price);
        info!(
            trade_id = %trade.trade_id,
            direction = ?direction,
            size = delta,
            "trade opened"
        );
        self.current_trade = Some(trade);

        if !self.published.contains(snap.local_id) {
            self.published.insert(snap.local_id);
            reports.push(Report::Execution {
                state_id: snap.local_id,
                okx_id: fill.exchange_id.clone(),
            });
        }
    }

    fn extend_trade(
        &mut self,
        snap: &OrderSnapshot,
        fill: &FillEvent,
        delta: f64,
        reports: &mut Vec<Report>,
    ) {
        if delta <= SIZE_EPSILON {
            return;
        }
        let trade = match self.current_trade.as_mut() {
            Some(t) => t,
            None => return,
        };
        let trade_id = trade.trade_id.clone();
        let fraction = if snap.intended_volume > 0.0 {
            (delta / snap.intended_volume).min(1.0)
        } else {
            0.0
        };
        upsert_trade_order(
            trade,
            snap,
            FillPortion {
                trade_id,
                size: delta,
                price: fill.avg_price,
                timestamp: fill.fill_time,
                is_closing: false,
                execution_fraction: fraction,
            },
        );
        trade.add_side_fill(fill.side, delta, fill.avg_price);
        if fill.pnl != 0.0 && fill.avg_price > 0.0 && fill.cumulative_filled > 0.0 {
            let pnl_fraction = fill.pnl / (fill.cumulative_filled * fill.avg_price);
            if pnl_fraction.is_finite() {
                trade.cumulative_reward += delta * pnl_fraction;
                trade.reduced_qty += delta;
            }
        }
        trade.net_size = trade.net_from_portions();

        if trade.net_size.abs() < SIZE_EPSILON {
            reports.extend(self.close_current_trade());
        } else if !self.published.contains(snap.local_id) {
            self.published.insert(snap.local_id);
            reports.push(Report::Execution {
                state_id: snap.local_id,
                okx_id: fill.exchange_id.clone(),
            });
        } else {
            reports.push(Report::ExecutionFraction {
                state_id: snap.local_id,
                okx_id: fill.exchange_id.clone(),
                fraction: snap.execution_fraction,
            });
        }
    }

    fn reduce_or_flip_trade(
        &mut self,
        snap: &OrderSnapshot,
        fill: &FillEvent,
        delta: f64,
        reports: &mut Vec<Report>,
    ) {
        if delta <= SIZE_EPSILON {
            return;
        }
        let trade = match self.current_trade.as_mut() {
            Some(t) => t,
            None => return,
        };
        let prior_net = trade.net_size;
        let closing = delta.min(prior_net.abs());
        let opening = delta - closing;

        let trade_id = trade.trade_id.clone();
        let closing_fraction = if snap.intended_volume > 0.0 {
            (closing / snap.intended_volume).min(1.0)
        } else {
            0.0
        };
        if closing > 0.0 {
            let mut closing_snap = snap.clone();
            closing_snap.execution_fraction = closing_fraction;
            upsert_trade_order(
                trade,
                &closing_snap,
                FillPortion {
                    trade_id,
                    size: closing,
                    price: fill.avg_price,
                    timestamp: fill.fill_time,
                    is_closing: true,
                    execution_fraction: closing_fraction,
                },
            );
            trade.add_side_fill(fill.side, closing, fill.avg_price);
            trade.reduced_qty += closing;
            trade.net_size = if prior_net > 0.0 {
                (prior_net - closing).max(0.0)
            } else {
                (prior_net + closing).min(0.0)
            };
        }

        let mut split = false;
        if opening >= MIN_OPENING {
            split = true;
            let direction = TradeDirection::from_side(fill.side);
            let mut follow_on = Trade::open(fill.exchange_id.clone(), direction, opening);
            let opening_fraction = if snap.intended_volume > 0.0 {
                (opening / snap.intended_volume).min(1.0)
            } else {
                0.0
            };
            let mut opening_snap = snap.clone();
            opening_snap.execution_fraction = opening_fraction;
            let follow_on_trade_id = follow_on.trade_id.clone();
            upsert_trade_order(
                &mut follow_on,
                &opening_snap,
                FillPortion {
                    trade_id: follow_on_trade_id,
                    size: opening,
                    price: fill.avg_price,
                    timestamp: fill.fill_time,
                    is_closing: false,
                    execution_fraction: opening_fraction,
                },
            );
            follow_on.add_side_fill(fill.side, opening, fill.avg_price);
            info!(
                trade_id = %follow_on.trade_id,
                direction = ?direction,
                size = opening,
                "follow-on trade parked"
            );
            if self.next_trade.is_some() {
                warn!("replacing an already-parked follow-on trade");
            }
            self.next_trade = Some(follow_on);

            // A split publishes both fractions; the pair is guarded as one
            // emission per state id.
            if !self.published.contains(snap.local_id) {
                self.published.insert(snap.local_id);
            }
            reports.push(Report::ExecutionFraction {
                state_id: snap.local_id,
                okx_id: fill.exchange_id.clone(),
                fraction: closing_fraction,
            });
            reports.push(Report::ExecutionFraction {
                state_id: snap.local_id,
                okx_id: fill.exchange_id.clone(),
                fraction: opening_fraction,
            });
        }

        let closed = self
            .current_trade
            .as_ref()
            .map(|t| t.net_size.abs() < SIZE_EPSILON)
            .unwrap_or(false);
        if closed {
            reports.extend(self.close_current_trade());
        } else if !split {
            // Partial reduction: ordinary progress report.
            if !self.published.contains(snap.local_id) {
                self.published.insert(snap.local_id);
                reports.push(Report::Execution {
                    state_id: snap.local_id,
                    okx_id: fill.exchange_id.clone(),
                });
            } else {
                reports.push(Report::ExecutionFraction {
                    state_id: snap.local_id,
                    okx_id: fill.exchange_id.clone(),
                    fraction: snap.execution_fraction,
                });
            }
        }
    }

    /// Single closure routine for every path that drives |net| under
    /// epsilon: compute the reward, emit the closure report, then switch
    /// to the parked follow-on trade or reset to flat.
    fn close_current_trade(&mut self) -> Vec<Report> {
        let trade = match self.current_trade.take() {
            Some(t) => t,
            None => return Vec::new(),
        };
        let reward = self.compute_reward(&trade);
        TRADES_CLOSED.inc();
        LAST_REWARD.set(reward);

        let mut filled_portions = Vec::new();
        for order in &trade.orders {
            let okx_id = order.exchange_id.clone().unwrap_or_default();
            if order.fill_portions.is_empty() {
                filled_portions
                    .push((okx_id, (order.execution_fraction * 100.0).min(100.0)));
            } else {
                for portion in &order.fill_portions {
                    filled_portions.push((
                        okx_id.clone(),
                        (portion.execution_fraction * 100.0).min(100.0),
                    ));
                }
            }
        }

        info!(
            trade_id = %trade.trade_id,
            reward,
            orders = trade.orders.len(),
            "trade closed"
        );

        // Flat again: the drawdown tracker restarts with the next trade.
        self.maxdd = 0.0;
        MAXDD.set(0.0);
        self.current_trade = self.next_trade.take();

        vec![Report::TradeClosure { filled_portions, reward }]
    }

    fn compute_reward(&self, trade: &Trade) -> f64 {
        let avg_buy = trade.avg_buy_price();
        let avg_sell = trade.avg_sell_price();
        if avg_buy <= 0.0 || avg_sell <= 0.0 {
            return 0.0;
        }
        let base = match trade.direction {
            Some(TradeDirection::Long) => (avg_sell - avg_buy) / avg_buy * 10_000.0,
            Some(TradeDirection::Short) => (avg_buy - avg_sell) / avg_sell * 10_000.0,
            None => 0.0,
        };
        let dd = self.maxdd.abs();
        if base > 0.0 {
            base * (1.0 - 2.0 * dd)
        } else if base < 0.0 {
            base * (1.0 + 2.0 * dd)
        } else {
            0.0
        }
    }

    fn retire_filled(&mut self, exchange_id: &str) {
        if let Some(i) = self.active_orders.iter().position(|o| {
            o.exchange_id.as_deref() == Some(exchange_id) && o.state == OrderState::Filled
        }) {
            if let Some(order) = self.active_orders.remove(i) {
                if let Some(id) = order.exchange_id {
                    self.known_orders.insert(id, order.local_id);
                }
            }
        }
    }

    fn enforce_order_cap(&mut self) {
        // Overflow always sheds the oldest entry; it is queued for
        // cancellation when it is live and still unfilled. Its exchange id
        // stays recognisable for late fills either way.
        while self.active_orders.len() > MAX_ACTIVE_ORDERS {
            let order = match self.active_orders.pop_front() {
                Some(o) => o,
                None => break,
            };
            let cancellable = matches!(
                order.state,
                OrderState::Live | OrderState::PartiallyFilled
            ) && order.cumulative_filled < order.intended_volume;
            if let Some(id) = order.exchange_id {
                self.known_orders.insert(id.clone(), order.local_id);
                if cancellable {
                    self.cancel_queue
                        .push_back(CancelEntry { exchange_id: id, sent: false });
                }
            }
        }
    }
}

enum TradeRelation {
    Flat,
    SameDirection,
    OppositeDirection,
}

/// Service loop: actions in from the broker, events in from the exchange
/// client, reports out to the execution exchange, one cancel per tick.
pub async fn run(
    cfg: LifecycleConfig,
    channel: Channel,
    client: OkxClient,
    mut events: mpsc::Receiver<OkxEvent>,
) -> anyhow::Result<()> {
    let sizing = SizingPolicy::new(cfg.margin_cap_percent, cfg.leverage, cfg.min_contract);
    let mut engine = LifecycleEngine::new(sizing, cfg.leverage);

    // The exchange must report a balance before any order flows.
    info!("waiting for initial balance");
    let wait = Duration::from_secs(30);
    loop {
        match timeout(wait, events.recv()).await {
            Ok(Some(OkxEvent::Balance { cash })) => {
                engine.on_balance(cash);
                break;
            }
            Ok(Some(_)) => continue,
            Ok(None) => anyhow::bail!("exchange event stream closed during startup"),
            Err(_) => anyhow::bail!("no balance from exchange within 30s"),
        }
    }
    info!(balance = engine.balance(), "lifecycle engine live, consuming actions");

    let mut actions = channel
        .basic_consume(
            ACTION_QUEUE,
            "lifecycle-actions",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let mut cancel_tick = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            delivery = actions.next() => {
                let delivery = match delivery {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => { error!(?e, "action consumer error"); continue; }
                    None => anyhow::bail!("action consumer closed"),
                };
                match ActionFrame::decode(&delivery.data) {
                    Ok(frame) => {
                        if let Some(req) = engine.on_action(&frame) {
                            ORDERS_SUBMITTED.inc();
                            client
                                .submit_order(req.state_id, req.side, req.order_type, req.size, req.price)
                                .await;
                        }
                    }
                    Err(e) => warn!(?e, "dropping malformed action frame"),
                }
                delivery.ack(BasicAckOptions::default()).await?;
            }
            event = events.recv() => {
                let event = match event {
                    Some(e) => e,
                    None => anyhow::bail!("exchange event stream closed"),
                };
                let reports = engine.handle_event(event);
                for report in reports {
                    EXEC_REPORTS.with_label_values(&[report.kind()]).inc();
                    let payload = report.to_json().to_string();
                    // A publish failure is logged but never rolls state
                    // back; delivery is at-least-once end to end.
                    if let Err(e) = broker::publish_json(
                        &channel,
                        EXECUTION_EXCHANGE,
                        EXECUTION_ROUTING_KEY,
                        payload.as_bytes(),
                    )
                    .await
                    {
                        error!(?e, "execution report publish failed");
                    }
                }
            }
            _ = cancel_tick.tick() => {
                if let Some(exchange_id) = engine.next_cancel() {
                    CANCELS_SENT.inc();
                    client.cancel_order(exchange_id).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_balance(balance: f64) -> LifecycleEngine {
        let mut engine = LifecycleEngine::new(SizingPolicy::new(20.0, 100.0, 0.1), 100.0);
        engine.on_balance(balance);
        engine
    }

    /// Put a live order into the engine the way an action + ack would.
    fn track_order(
        engine: &mut LifecycleEngine,
        state_id: u16,
        exchange_id: &str,
        side: Side,
        volume: f64,
        price: f64,
    ) {
        let mut order = OrderRecord::new(state_id, side, volume, price);
        order.exchange_id = Some(exchange_id.to_string());
        order.state = OrderState::Live;
        engine.active_orders.push_back(order);
        engine.known_orders.insert(exchange_id.to_string(), state_id);
    }

    fn fill(
        exchange_id: &str,
        cumulative: f64,
        price: f64,
        side: Side,
        state: OrderState,
        fill_time: i64,
    ) -> FillEvent {
        FillEvent {
            exchange_id: exchange_id.to_string(),
            cumulative_filled: cumulative,
            avg_price: price,
            side,
            state,
            pnl: 0.0,
            fill_time,
        }
    }

    fn closure_report(reports: &[Report]) -> &Report {
        reports
            .iter()
            .find(|r| matches!(r, Report::TradeClosure { .. }))
            .expect("closure report emitted")
    }

    #[test]
    fn scenario_long_round_trip() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 1.0, 30300.0);

        let reports = engine.on_fill(&fill("buy-1", 1.0, 30000.0, Side::Buy, OrderState::Filled, 10));
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0],
            Report::Execution { state_id: 2, okx_id } if okx_id == "buy-1"
        ));
        assert!((engine.net_position() - 1.0).abs() < 1e-12);

        let reports =
            engine.on_fill(&fill("sell-1", 1.0, 30300.0, Side::Sell, OrderState::Filled, 20));
        // Exact close: the closure report alone.
        assert_eq!(reports.len(), 1);
        match closure_report(&reports) {
            Report::TradeClosure { filled_portions, reward } => {
                assert!((*reward - 100.0).abs() < 1e-9);
                assert_eq!(filled_portions.len(), 2);
                assert_eq!(filled_portions[0], ("buy-1".to_string(), 100.0));
                assert_eq!(filled_portions[1], ("sell-1".to_string(), 100.0));
            }
            _ => unreachable!(),
        }
        assert_eq!(engine.net_position(), 0.0);
        assert!(engine.current_trade.is_none());
    }

    #[test]
    fn scenario_short_round_trip() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 6, "sell-1", Side::Sell, 2.0, 40000.0);
        track_order(&mut engine, 8, "buy-1", Side::Buy, 2.0, 39600.0);

        engine.on_fill(&fill("sell-1", 2.0, 40000.0, Side::Sell, OrderState::Filled, 10));
        assert!((engine.net_position() + 2.0).abs() < 1e-12, "short is negative");

        let reports =
            engine.on_fill(&fill("buy-1", 2.0, 39600.0, Side::Buy, OrderState::Filled, 20));
        match closure_report(&reports) {
            Report::TradeClosure { reward, .. } => {
                let expected = (40000.0 - 39600.0) / 39600.0 * 10_000.0;
                assert!((*reward - expected).abs() < 1e-9);
                assert!((*reward - 101.0101).abs() < 0.001);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn scenario_position_flip() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 3.0, 30150.0);

        engine.on_fill(&fill("buy-1", 1.0, 30000.0, Side::Buy, OrderState::Filled, 10));
        let reports =
            engine.on_fill(&fill("sell-1", 3.0, 30150.0, Side::Sell, OrderState::Filled, 20));

        // Two fraction reports (closing, opening) then the closure.
        assert_eq!(reports.len(), 3);
        match &reports[0] {
            Report::ExecutionFraction { state_id: 4, okx_id, fraction } => {
                assert_eq!(okx_id, "sell-1");
                assert!((fraction - 1.0 / 3.0).abs() < 1e-12, "closing fraction");
            }
            other => panic!("expected closing fraction, got {other:?}"),
        }
        match &reports[1] {
            Report::ExecutionFraction { state_id: 4, fraction, .. } => {
                assert!((fraction - 2.0 / 3.0).abs() < 1e-12, "opening fraction");
            }
            other => panic!("expected opening fraction, got {other:?}"),
        }
        match &reports[2] {
            Report::TradeClosure { reward, filled_portions } => {
                assert!((*reward - 50.0).abs() < 1e-9);
                // buy opening portion + sell closing portion
                assert_eq!(filled_portions.len(), 2);
                assert_eq!(filled_portions[0].0, "buy-1");
                assert!((filled_portions[0].1 - 100.0).abs() < 1e-9);
                assert_eq!(filled_portions[1].0, "sell-1");
                assert!((filled_portions[1].1 - 100.0 / 3.0).abs() < 1e-9);
            }
            other => panic!("expected closure, got {other:?}"),
        }

        // The follow-on trade is active, short, 2.0, keyed by the sell id.
        let trade = engine.current_trade.as_ref().expect("follow-on active");
        assert_eq!(trade.trade_id, "sell-1");
        assert_eq!(trade.direction, Some(TradeDirection::Short));
        assert!((trade.net_size + 2.0).abs() < 1e-12);
        assert!(engine.next_trade.is_none());
    }

    #[test]
    fn scenario_partial_fill_progression() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);

        let r1 = engine.on_fill(&fill(
            "buy-1", 0.3, 30000.0, Side::Buy, OrderState::PartiallyFilled, 10,
        ));
        let r2 = engine.on_fill(&fill(
            "buy-1", 0.8, 30005.0, Side::Buy, OrderState::PartiallyFilled, 20,
        ));
        let r3 = engine.on_fill(&fill("buy-1", 1.0, 30010.0, Side::Buy, OrderState::Filled, 30));

        assert_eq!(r1.len(), 1);
        assert!(matches!(&r1[0], Report::Execution { state_id: 2, .. }));
        let f2 = match &r2[0] {
            Report::ExecutionFraction { fraction, .. } => *fraction,
            other => panic!("expected fraction report, got {other:?}"),
        };
        let f3 = match &r3[0] {
            Report::ExecutionFraction { fraction, .. } => *fraction,
            other => panic!("expected fraction report, got {other:?}"),
        };
        assert!((f2 - 0.8).abs() < 1e-12);
        assert!((f3 - 1.0).abs() < 1e-12);
        assert!(f2 <= f3, "execution fraction never regresses");
        assert!((engine.net_position() - 1.0).abs() < 1e-12);

        // Net equals the sum of buy portions minus sell portions.
        let trade = engine.current_trade.as_ref().unwrap();
        assert!((trade.net_from_portions() - 1.0).abs() < 1e-12);
        // Fully filled order left the active deque but stays known.
        assert!(engine.active_orders.is_empty());
        assert!(engine.known_orders.contains_key("buy-1"));
    }

    #[test]
    fn scenario_unknown_exchange_id_is_ignored() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);
        engine.on_fill(&fill("buy-1", 0.5, 30000.0, Side::Buy, OrderState::PartiallyFilled, 10));

        let before_net = engine.net_position();
        let before_orders = engine.active_orders.len();
        let reports =
            engine.on_fill(&fill("ghost", 5.0, 31000.0, Side::Sell, OrderState::Filled, 20));
        assert!(reports.is_empty());
        assert_eq!(engine.net_position(), before_net);
        assert_eq!(engine.active_orders.len(), before_orders);
        assert!(!engine.known_orders.contains_key("ghost"));
    }

    #[test]
    fn closing_plus_opening_equals_delta() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.5, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 2.0, 30100.0);

        engine.on_fill(&fill("buy-1", 1.5, 30000.0, Side::Buy, OrderState::Filled, 10));
        let prior_net = engine.net_position();
        engine.on_fill(&fill("sell-1", 2.0, 30100.0, Side::Sell, OrderState::Filled, 20));

        // closing = min(2.0, 1.5) = 1.5, opening = 0.5
        let follow_on = engine.current_trade.as_ref().expect("flip parked and activated");
        assert!((follow_on.net_size - (-(2.0 - prior_net))).abs() < 1e-12);
        assert!((follow_on.net_size + 0.5).abs() < 1e-12);
    }

    #[test]
    fn partial_reduction_keeps_trade_open() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 2.0, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 1.0, 30100.0);

        engine.on_fill(&fill("buy-1", 2.0, 30000.0, Side::Buy, OrderState::Filled, 10));
        let reports =
            engine.on_fill(&fill("sell-1", 1.0, 30100.0, Side::Sell, OrderState::Filled, 20));

        // Reduction without closure: one plain report, no closure.
        assert_eq!(reports.len(), 1);
        assert!(matches!(&reports[0], Report::Execution { state_id: 4, .. }));
        assert!((engine.net_position() - 1.0).abs() < 1e-12);
        let trade = engine.current_trade.as_ref().unwrap();
        assert_eq!(trade.direction, Some(TradeDirection::Long));
        assert!(engine.next_trade.is_none());
    }

    #[test]
    fn drawdown_scales_the_reward() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 1.0, 30300.0);

        engine.on_fill(&fill("buy-1", 1.0, 30000.0, Side::Buy, OrderState::Filled, 10));
        engine.on_position(-0.05);
        engine.on_position(-0.02); // less negative: ignored
        assert_eq!(engine.maxdd, -0.05);

        let reports =
            engine.on_fill(&fill("sell-1", 1.0, 30300.0, Side::Sell, OrderState::Filled, 20));
        match closure_report(&reports) {
            Report::TradeClosure { reward, .. } => {
                assert!((*reward - 100.0 * (1.0 - 2.0 * 0.05)).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
        assert_eq!(engine.maxdd, 0.0, "drawdown resets on flat");
    }

    #[test]
    fn negative_reward_is_scaled_the_other_way() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);
        track_order(&mut engine, 4, "sell-1", Side::Sell, 1.0, 29700.0);

        engine.on_fill(&fill("buy-1", 1.0, 30000.0, Side::Buy, OrderState::Filled, 10));
        engine.on_position(-0.1);
        let reports =
            engine.on_fill(&fill("sell-1", 1.0, 29700.0, Side::Sell, OrderState::Filled, 20));
        match closure_report(&reports) {
            Report::TradeClosure { reward, .. } => {
                let base = (29700.0 - 30000.0) / 30000.0 * 10_000.0;
                assert!((*reward - base * (1.0 + 2.0 * 0.1)).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn maxdd_ignored_when_flat() {
        let mut engine = engine_with_balance(1_000_000.0);
        engine.on_position(-0.5);
        assert_eq!(engine.maxdd, 0.0);
    }

    #[test]
    fn duplicate_fill_update_is_a_noop() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "buy-1", Side::Buy, 1.0, 30000.0);

        let event = fill("buy-1", 0.5, 30000.0, Side::Buy, OrderState::PartiallyFilled, 10);
        let first = engine.on_fill(&event);
        assert_eq!(first.len(), 1);
        let second = engine.on_fill(&event);
        assert!(second.is_empty(), "no new fill delta, no report");
        assert!((engine.net_position() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn order_cap_queues_oldest_live_unfilled_for_cancel() {
        let mut engine = engine_with_balance(1_000_000.0);
        for i in 0..(MAX_ACTIVE_ORDERS as u16 + 1) {
            track_order(&mut engine, i, &format!("o-{i}"), Side::Buy, 1.0, 30000.0);
        }
        engine.enforce_order_cap();
        assert_eq!(engine.active_orders.len(), MAX_ACTIVE_ORDERS);
        assert_eq!(engine.cancel_queue.len(), 1);
        assert_eq!(engine.cancel_queue[0].exchange_id, "o-0");
        // The evicted id is still recognisable for late fills.
        assert!(engine.known_orders.contains_key("o-0"));

        // One cancel at a time.
        assert_eq!(engine.next_cancel().as_deref(), Some("o-0"));
        assert!(engine.next_cancel().is_none(), "nothing new until confirmed");
        engine.on_cancel_confirmed("o-0");
        assert!(engine.cancel_queue.is_empty());
    }

    #[test]
    fn order_cap_sheds_an_unacked_front_entry_without_cancel() {
        let mut engine = engine_with_balance(1_000_000.0);
        // The oldest order never got acked, so it has no exchange id.
        engine
            .active_orders
            .push_back(OrderRecord::new(0, Side::Buy, 1.0, 30000.0));
        for i in 1..=(MAX_ACTIVE_ORDERS as u16) {
            track_order(&mut engine, i, &format!("o-{i}"), Side::Buy, 1.0, 30000.0);
        }
        engine.enforce_order_cap();
        assert_eq!(engine.active_orders.len(), MAX_ACTIVE_ORDERS);
        assert!(engine.cancel_queue.is_empty(), "nothing to cancel for an un-acked order");
        assert_eq!(
            engine.active_orders.front().map(|o| o.local_id),
            Some(1),
            "the oldest entry is shed, not skipped"
        );
    }

    #[test]
    fn late_fill_restores_evicted_order_and_voids_cancel() {
        let mut engine = engine_with_balance(1_000_000.0);
        for i in 0..(MAX_ACTIVE_ORDERS as u16 + 1) {
            track_order(&mut engine, i, &format!("o-{i}"), Side::Buy, 1.0, 30000.0);
        }
        engine.enforce_order_cap();
        assert_eq!(engine.cancel_queue.len(), 1);

        let reports = engine.on_fill(&fill(
            "o-0", 1.0, 30000.0, Side::Buy, OrderState::Filled, 99,
        ));
        assert!(!reports.is_empty(), "restored order produces a report");
        assert!(engine.cancel_queue.is_empty(), "pending cancel is moot");
        assert!((engine.net_position() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn exchange_reject_removes_pending_order() {
        let mut engine = engine_with_balance(1_000_000.0);
        let frame = ActionFrame {
            kind: 0,
            price_offset: -0.5,
            volume_fraction: 1.0,
            mid_price: 30000.0,
            state_id: 12,
        };
        let req = engine.on_action(&frame).expect("accepted");
        assert_eq!(engine.active_orders.len(), 1);
        engine.on_order_rejected(req.state_id, "insufficient margin");
        assert!(engine.active_orders.is_empty());
    }

    #[test]
    fn action_derivation_matches_the_sizing_rules() {
        let mut engine = engine_with_balance(10_000.0);
        let frame = ActionFrame {
            kind: 0,
            price_offset: -0.5,
            volume_fraction: 0.8,
            mid_price: 30000.0,
            state_id: 40,
        };
        let req = engine.on_action(&frame).expect("accepted");
        assert_eq!(req.side, Side::Buy, "negative offset buys");
        assert_eq!(req.order_type, OrderType::Limit);
        let expected_price = 30000.0 * (1.0 - 0.5 / 1000.0);
        assert!((req.price - expected_price).abs() < 1e-9);
        let margin = 10_000.0 * 0.001 * 0.8;
        let expected_size = (100.0 * margin * 100.0 / expected_price * 10.0).ceil() / 10.0;
        assert!((req.size - expected_size).abs() < 1e-9);
        assert_eq!(engine.active_orders.len(), 1);
        assert_eq!(engine.active_orders[0].local_id, 40);

        // Positive offset sells; non-zero kind goes market.
        let frame = ActionFrame {
            kind: 1,
            price_offset: 0.5,
            volume_fraction: 0.8,
            mid_price: 30000.0,
            state_id: 42,
        };
        let req = engine.on_action(&frame).expect("accepted");
        assert_eq!(req.side, Side::Sell);
        assert_eq!(req.order_type, OrderType::Market);
    }

    #[test]
    fn tiny_action_is_dropped_silently() {
        // Zero margin budget derives a zero size, which is below the
        // contract minimum (upward rounding lifts any positive size to 0.1).
        let mut engine = engine_with_balance(10.0);
        let frame = ActionFrame {
            kind: 0,
            price_offset: -0.5,
            volume_fraction: 0.0,
            mid_price: 30000.0,
            state_id: 44,
        };
        assert!(engine.on_action(&frame).is_none());
        assert!(engine.active_orders.is_empty());
    }

    #[test]
    fn report_json_shapes() {
        let plain = Report::Execution { state_id: 7, okx_id: "abc".into() };
        assert_eq!(
            plain.to_json(),
            json!({"state_id": 7, "okx_id": "abc", "is_trade_closed": false})
        );

        let fraction = Report::ExecutionFraction {
            state_id: 7,
            okx_id: "abc".into(),
            fraction: 0.25,
        };
        assert_eq!(
            fraction.to_json(),
            json!({"state_id": 7, "okx_id": "abc", "is_trade_closed": false, "execution_percentage": 0.25})
        );

        let closure = Report::TradeClosure {
            filled_portions: vec![("abc".into(), 100.0), ("def".into(), 33.0)],
            reward: 50.0,
        };
        assert_eq!(
            closure.to_json(),
            json!({
                "is_trade_closed": true,
                "filled_portions": [{"abc": 100.0}, {"def": 33.0}],
                "reward": 50.0
            })
        );
    }

    #[test]
    fn published_guard_is_bounded_and_deduping() {
        let mut ids = PublishedIds::new();
        ids.insert(1);
        ids.insert(1);
        assert!(ids.contains(1));
        assert_eq!(ids.order.len(), 1, "duplicate insert not re-queued");
    }

    #[test]
    fn net_size_matches_portion_sums_through_an_interleaving() {
        let mut engine = engine_with_balance(1_000_000.0);
        track_order(&mut engine, 2, "b1", Side::Buy, 2.0, 30000.0);
        track_order(&mut engine, 4, "s1", Side::Sell, 1.0, 30100.0);
        track_order(&mut engine, 6, "b2", Side::Buy, 1.0, 30050.0);

        let steps = [
            fill("b1", 1.0, 30000.0, Side::Buy, OrderState::PartiallyFilled, 10),
            fill("s1", 0.4, 30100.0, Side::Sell, OrderState::PartiallyFilled, 20),
            fill("b1", 2.0, 30010.0, Side::Buy, OrderState::Filled, 30),
            fill("b2", 1.0, 30050.0, Side::Buy, OrderState::Filled, 40),
            fill("s1", 1.0, 30100.0, Side::Sell, OrderState::Filled, 50),
        ];
        for step in &steps {
            engine.on_fill(step);
            if let Some(trade) = engine.current_trade.as_ref() {
                assert!(
                    (trade.net_size - trade.net_from_portions()).abs() < 1e-9,
                    "net_size tracks portion sums at every step"
                );
            }
        }
        // 1.0 - 0.4 + 1.0 + 1.0 - 0.6 = 2.0 net long
        assert!((engine.net_position() - 2.0).abs() < 1e-9);
    }
}
