// ===============================
// src/relay.rs
// ===============================
//
// Decision relay: buffers feature frames, invokes the policy over the
// newest window, publishes action frames, and correlates execution
// reports back into completed trades for the training hook.

use std::collections::VecDeque;

use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::broker::{
    self, ACTION_ROUTING_KEY, OMS_EXCHANGE, RELAY_EXECUTION_QUEUE, RELAY_FRAME_QUEUE,
};
use crate::codec::{decode_feature_frame, ActionFrame, BookState};
use crate::domain::ExecutionReportMsg;
use crate::metrics::{RELAY_ACTIONS, RELAY_DECISIONS, RELAY_FRAMES, RELAY_TRADES_OBSERVED};
use crate::policy::{ActionInfo, Policy, TrainingOrder, TrainingTrade};

pub const FRAME_BUFFER_SIZE: usize = 1000;
pub const ACTION_BUFFER_SIZE: usize = 1000;
/// Frames per decision window.
pub const NETWORK_WINDOW: usize = 80;
/// Decisions subject to the exploration gate.
pub const EXPLORATION_DECISIONS: u64 = 1000;

pub struct DecisionRelay<P: Policy> {
    frames: VecDeque<BookState>,
    actions: VecDeque<ActionInfo>,
    policy: P,
    decisions: u64,
    exploration_decisions: u64,
    skeleton: TrainingTrade,
}

impl<P: Policy> DecisionRelay<P> {
    pub fn new(policy: P) -> Self {
        Self::with_exploration(policy, EXPLORATION_DECISIONS)
    }

    pub fn with_exploration(policy: P, exploration_decisions: u64) -> Self {
        Self {
            frames: VecDeque::with_capacity(FRAME_BUFFER_SIZE),
            actions: VecDeque::with_capacity(ACTION_BUFFER_SIZE),
            policy,
            decisions: 0,
            exploration_decisions,
            skeleton: TrainingTrade::default(),
        }
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn pending_orders(&self) -> usize {
        self.skeleton.orders.len()
    }

    /// Buffer one frame; produce an action when the window is full and the
    /// newest sequence id has even parity (throughput shaping upstream).
    pub fn on_frame(&mut self, state: BookState) -> Option<ActionFrame> {
        if self.frames.len() == FRAME_BUFFER_SIZE {
            self.frames.pop_front();
        }
        self.frames.push_back(state);

        if self.frames.len() < NETWORK_WINDOW {
            return None;
        }
        let newest_id = self.frames.back().map(|s| s.state_id)?;
        if newest_id % 2 != 0 {
            return None;
        }

        let frames = self.frames.make_contiguous();
        let window = &frames[frames.len() - NETWORK_WINDOW..];
        let decision = self.policy.decide(window);
        let newest = &window[NETWORK_WINDOW - 1];
        let mid_price = newest.mid_price;

        self.decisions += 1;
        RELAY_DECISIONS.inc();

        let mut price_offset = decision.price_offset.clamp(-1.0, 1.0);
        if self.decisions <= self.exploration_decisions && rand::thread_rng().gen_bool(0.5) {
            price_offset = -price_offset;
            debug!(
                decision = self.decisions,
                price_offset, "exploration gate flipped price offset"
            );
        }

        let action = ActionInfo {
            price_offset,
            volume_fraction: decision.volume_fraction.clamp(0.0, 1.0),
            state_id: newest_id,
        };
        if self.actions.len() == ACTION_BUFFER_SIZE {
            self.actions.pop_front();
        }
        self.actions.push_back(action);

        Some(ActionFrame {
            kind: 0,
            price_offset: action.price_offset,
            volume_fraction: action.volume_fraction,
            mid_price,
            state_id: newest_id,
        })
    }

    pub fn on_execution_report(&mut self, msg: &ExecutionReportMsg) {
        if msg.is_trade_closed {
            self.on_trade_closed(msg);
        } else {
            self.on_order_executed(msg);
        }
    }

    fn on_order_executed(&mut self, msg: &ExecutionReportMsg) {
        let (state_id, okx_id) = match (msg.state_id, msg.okx_id.as_ref()) {
            (Some(s), Some(o)) => (s as u16, o.clone()),
            _ => {
                warn!("execution update missing state_id or okx_id");
                return;
            }
        };

        if self.skeleton.orders.iter().any(|o| o.okx_id == okx_id) {
            warn!(%okx_id, "duplicate order update, ignoring");
            return;
        }

        // The 80 ids whose frames formed the decision window, oldest
        // first, wrapping through 2^16.
        let start = state_id.wrapping_sub(NETWORK_WINDOW as u16 - 1);
        let state_ids: Vec<u16> = (0..NETWORK_WINDOW as u16)
            .map(|i| start.wrapping_add(i))
            .collect();

        let matches: Vec<ActionInfo> = self
            .actions
            .iter()
            .filter(|a| a.state_id == state_id)
            .copied()
            .collect();
        let action = match matches.len() {
            0 => {
                warn!(state_id, "no buffered action for execution update");
                None
            }
            1 => Some(matches[0]),
            n => {
                warn!(state_id, n, "multiple buffered actions for state id");
                Some(matches[0])
            }
        };

        info!(%okx_id, state_id, "order joined trade skeleton");
        self.skeleton.orders.push(TrainingOrder {
            okx_id,
            state_ids,
            action,
            coefficient: 0.0,
        });
    }

    fn on_trade_closed(&mut self, msg: &ExecutionReportMsg) {
        if self.skeleton.orders.is_empty() && msg.filled_portions.is_none() {
            warn!("trade closure without any tracked orders");
            return;
        }

        if let Some(portions) = &msg.filled_portions {
            for portion in portions {
                for (okx_id, coefficient) in portion {
                    if let Some(order) =
                        self.skeleton.orders.iter_mut().find(|o| &o.okx_id == okx_id)
                    {
                        order.coefficient = *coefficient;
                    }
                }
            }
        }
        self.skeleton.reward = msg.reward.unwrap_or(0.0);

        info!(
            reward = self.skeleton.reward,
            orders = self.skeleton.orders.len(),
            "trade closed, handing to policy"
        );
        self.policy.observe(&self.skeleton);
        RELAY_TRADES_OBSERVED.inc();
        self.skeleton = TrainingTrade::default();
    }
}

/// Service loop: one consumer per queue, merged into one state owner.
pub async fn run<P: Policy>(channel: Channel, policy: P) -> anyhow::Result<()> {
    let mut relay = DecisionRelay::new(policy);

    let mut frame_consumer = channel
        .basic_consume(
            RELAY_FRAME_QUEUE,
            "decision-relay-frames",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let mut exec_consumer = channel
        .basic_consume(
            RELAY_EXECUTION_QUEUE,
            "decision-relay-executions",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("decision relay started, waiting for frames");

    loop {
        tokio::select! {
            delivery = frame_consumer.next() => {
                let delivery = match delivery {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => { error!(?e, "frame consumer error"); continue; }
                    None => anyhow::bail!("frame consumer closed"),
                };
                RELAY_FRAMES.inc();
                match decode_feature_frame(&delivery.data) {
                    Ok(state) => {
                        if let Some(frame) = relay.on_frame(state) {
                            match frame.encode() {
                                Ok(payload) => {
                                    if let Err(e) = broker::publish_binary(
                                        &channel, OMS_EXCHANGE, ACTION_ROUTING_KEY, &payload,
                                    ).await {
                                        error!(?e, "action publish failed");
                                        delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
                                        continue;
                                    }
                                    RELAY_ACTIONS.inc();
                                }
                                Err(e) => error!(?e, "action frame rejected by encoder"),
                            }
                        }
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                    Err(e) => {
                        // Malformed frame: drop it, do not requeue.
                        warn!(?e, "dropping malformed feature frame");
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                }
            }
            delivery = exec_consumer.next() => {
                let delivery = match delivery {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => { error!(?e, "execution consumer error"); continue; }
                    None => anyhow::bail!("execution consumer closed"),
                };
                match serde_json::from_slice::<ExecutionReportMsg>(&delivery.data) {
                    Ok(msg) => {
                        relay.on_execution_report(&msg);
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                    Err(e) => {
                        warn!(?e, "dropping malformed execution report");
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LEVELS_PER_SIDE, NUM_DEPTHS, NUM_FEATURES, VALUES_PER_LEVEL};
    use crate::policy::Decision;

    struct FixedPolicy {
        decision: Decision,
        observed: Vec<TrainingTrade>,
        windows_seen: Vec<Vec<u16>>,
    }

    impl FixedPolicy {
        fn new(price_offset: f64, volume_fraction: f64) -> Self {
            Self {
                decision: Decision { price_offset, volume_fraction },
                observed: Vec::new(),
                windows_seen: Vec::new(),
            }
        }
    }

    impl Policy for FixedPolicy {
        fn decide(&mut self, window: &[BookState]) -> Decision {
            self.windows_seen
                .push(window.iter().map(|s| s.state_id).collect());
            self.decision
        }

        fn observe(&mut self, trade: &TrainingTrade) {
            self.observed.push(trade.clone());
        }
    }

    fn state(state_id: u16) -> BookState {
        BookState {
            bids: vec![0.0; LEVELS_PER_SIDE * VALUES_PER_LEVEL],
            asks: vec![0.0; LEVELS_PER_SIDE * VALUES_PER_LEVEL],
            mid_change: 0.0,
            features: [0.0; NUM_DEPTHS * NUM_FEATURES],
            mid_price: 30000.0,
            state_id,
        }
    }

    fn relay_without_exploration() -> DecisionRelay<FixedPolicy> {
        DecisionRelay::with_exploration(FixedPolicy::new(0.25, 0.5), 0)
    }

    #[test]
    fn no_decision_before_window_fills() {
        let mut relay = relay_without_exploration();
        for id in 0..(NETWORK_WINDOW as u16 - 1) {
            assert!(relay.on_frame(state(id)).is_none());
        }
        // 80th frame has id 79 (odd): still gated.
        assert!(relay.on_frame(state(79)).is_none());
        // 81st frame, id 80, even: decision fires.
        let frame = relay.on_frame(state(80)).expect("window full, even id");
        assert_eq!(frame.state_id, 80);
        assert_eq!(frame.kind, 0);
        assert_eq!(frame.price_offset, 0.25);
        assert_eq!(frame.volume_fraction, 0.5);
    }

    #[test]
    fn odd_parity_never_decides() {
        let mut relay = relay_without_exploration();
        for id in 0..200u16 {
            if let Some(frame) = relay.on_frame(state(id)) {
                assert_eq!(frame.state_id % 2, 0);
            }
        }
    }

    #[test]
    fn window_is_the_newest_80_frames_in_arrival_order() {
        let mut relay = relay_without_exploration();
        for id in 0..=100u16 {
            relay.on_frame(state(id));
        }
        let last_window = relay.policy.windows_seen.last().unwrap();
        assert_eq!(last_window.len(), NETWORK_WINDOW);
        assert_eq!(*last_window.first().unwrap(), 21);
        assert_eq!(*last_window.last().unwrap(), 100);
    }

    #[test]
    fn window_straddles_the_sequence_wrap() {
        let mut relay = relay_without_exploration();
        // 60 frames before the wrap, then 41 after it.
        for id in 65476..=65535u16 {
            relay.on_frame(state(id));
        }
        for id in 0..=40u16 {
            relay.on_frame(state(id));
        }
        let last_window = relay.policy.windows_seen.last().unwrap();
        assert_eq!(last_window.len(), NETWORK_WINDOW);
        assert_eq!(*last_window.first().unwrap(), 65497);
        assert_eq!(*last_window.last().unwrap(), 40);
    }

    #[test]
    fn frame_buffer_is_bounded() {
        let mut relay = relay_without_exploration();
        for i in 0..(FRAME_BUFFER_SIZE + 500) {
            relay.on_frame(state((i % 65536) as u16));
        }
        assert_eq!(relay.buffered_frames(), FRAME_BUFFER_SIZE);
    }

    fn exec_msg(state_id: u32, okx_id: &str) -> ExecutionReportMsg {
        ExecutionReportMsg {
            is_trade_closed: false,
            state_id: Some(state_id),
            okx_id: Some(okx_id.to_string()),
            execution_percentage: None,
            filled_portions: None,
            reward: None,
        }
    }

    #[test]
    fn execution_update_reconstructs_wrapping_window() {
        let mut relay = relay_without_exploration();
        relay.on_execution_report(&exec_msg(10, "ord-1"));
        assert_eq!(relay.pending_orders(), 1);
        let ids = &relay.skeleton.orders[0].state_ids;
        assert_eq!(ids.len(), NETWORK_WINDOW);
        assert_eq!(ids[0], 10u16.wrapping_sub(79));
        assert_eq!(*ids.last().unwrap(), 10);
        // contiguous modulo 2^16
        for pair in ids.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn duplicate_okx_id_is_ignored() {
        let mut relay = relay_without_exploration();
        relay.on_execution_report(&exec_msg(100, "ord-1"));
        relay.on_execution_report(&exec_msg(102, "ord-1"));
        assert_eq!(relay.pending_orders(), 1);
    }

    #[test]
    fn execution_update_attaches_matching_action() {
        let mut relay = relay_without_exploration();
        for id in 0..=100u16 {
            relay.on_frame(state(id));
        }
        relay.on_execution_report(&exec_msg(100, "ord-1"));
        let order = &relay.skeleton.orders[0];
        let action = order.action.expect("action 100 was buffered");
        assert_eq!(action.state_id, 100);
    }

    #[test]
    fn closure_attaches_coefficients_and_resets() {
        let mut relay = relay_without_exploration();
        relay.on_execution_report(&exec_msg(10, "ord-1"));
        relay.on_execution_report(&exec_msg(12, "ord-2"));

        let mut portion1 = std::collections::HashMap::new();
        portion1.insert("ord-1".to_string(), 100.0);
        let mut portion2 = std::collections::HashMap::new();
        portion2.insert("ord-2".to_string(), 33.3);
        let closure = ExecutionReportMsg {
            is_trade_closed: true,
            state_id: None,
            okx_id: None,
            execution_percentage: None,
            filled_portions: Some(vec![portion1, portion2]),
            reward: Some(50.0),
        };
        relay.on_execution_report(&closure);

        assert_eq!(relay.pending_orders(), 0, "skeleton reset after closure");
        let observed = relay.policy.observed.last().unwrap();
        assert_eq!(observed.reward, 50.0);
        assert_eq!(observed.orders.len(), 2);
        assert_eq!(observed.orders[0].coefficient, 100.0);
        assert_eq!(observed.orders[1].coefficient, 33.3);
    }

    #[test]
    fn exploration_gate_only_touches_the_sign() {
        let mut relay = DecisionRelay::with_exploration(FixedPolicy::new(0.25, 0.5), u64::MAX);
        for id in 0..=200u16 {
            if let Some(frame) = relay.on_frame(state(id)) {
                assert_eq!(frame.price_offset.abs(), 0.25);
                assert_eq!(frame.volume_fraction, 0.5);
            }
        }
    }
}
