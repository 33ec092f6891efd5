// ===============================
// src/policy.rs
// ===============================
//
// The decision seam. How decisions are produced is deliberately pluggable:
// the relay only needs `decide` over the buffered frame window and
// `observe` for closed trades. The default implementation is a
// rolling-window heuristic that leans against short-horizon imbalance.

use std::collections::VecDeque;

use crate::codec::BookState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Price offset in [-1, 1]; negative quotes below mid (a buy).
    pub price_offset: f64,
    /// Fraction of the per-action margin budget in [0, 1].
    pub volume_fraction: f64,
}

/// Action as remembered by the relay for later fill correlation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionInfo {
    pub price_offset: f64,
    pub volume_fraction: f64,
    pub state_id: u16,
}

#[derive(Debug, Clone)]
pub struct TrainingOrder {
    pub okx_id: String,
    /// The 80 state ids that formed the decision window, oldest first.
    pub state_ids: Vec<u16>,
    pub action: Option<ActionInfo>,
    /// Execution coefficient from the closure report (percent, 0-100).
    pub coefficient: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingTrade {
    pub reward: f64,
    pub orders: Vec<TrainingOrder>,
}

pub trait Policy: Send {
    fn decide(&mut self, window: &[BookState]) -> Decision;
    fn observe(&mut self, trade: &TrainingTrade);
}

const TRAINING_BUFFER_SIZE: usize = 100;

/// Mean-reversion on shallow-depth volume imbalance: quote against the
/// rolling average imbalance, sizing up as the signal strengthens.
pub struct ImbalancePolicy {
    window: VecDeque<f64>,
    sum: f64,
    w: usize,
    training_buffer: VecDeque<TrainingTrade>,
}

impl ImbalancePolicy {
    pub fn new(w: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(w),
            sum: 0.0,
            w,
            training_buffer: VecDeque::with_capacity(TRAINING_BUFFER_SIZE),
        }
    }

    fn push(&mut self, v: f64) {
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() {
                self.sum -= x;
            }
        }
        self.window.push_back(v);
        self.sum += v;
    }

    fn mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn observed_trades(&self) -> usize {
        self.training_buffer.len()
    }
}

impl Default for ImbalancePolicy {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Policy for ImbalancePolicy {
    fn decide(&mut self, window: &[BookState]) -> Decision {
        let newest = match window.last() {
            Some(s) => s,
            None => {
                return Decision { price_offset: 0.0, volume_fraction: 0.0 };
            }
        };
        // features[0] is the depth-10 volume imbalance.
        let imbalance = newest.features[0];
        self.push(imbalance);

        let signal = imbalance - self.mean();
        // Heavy bid pressure -> mid drifts up -> quote below mid (buy).
        let price_offset = (-signal).clamp(-1.0, 1.0);
        let volume_fraction = signal.abs().clamp(0.0, 1.0);
        Decision { price_offset, volume_fraction }
    }

    fn observe(&mut self, trade: &TrainingTrade) {
        if self.training_buffer.len() == TRAINING_BUFFER_SIZE {
            self.training_buffer.pop_front();
        }
        self.training_buffer.push_back(trade.clone());
    }
}
