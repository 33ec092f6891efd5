// ===============================
// src/book.rs
// ===============================
//
// Dense L2 order book for one instrument. The exchange feeds 400 levels
// per side; after every applied delta both sides must hold exactly that
// many levels or the session is poisoned and must be re-snapshotted.

use std::cmp::Ordering;
use std::collections::VecDeque;

use thiserror::Error;
use tracing::warn;

use crate::codec::{DEPTH_CUTOFFS, LEVELS_PER_SIDE, NUM_DEPTHS, NUM_FEATURES};

/// How many past side snapshots to retain for change features.
const HISTORY_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub volume: f64,
    pub orders: f64,
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("book holds {bids} bids / {asks} asks, expected {LEVELS_PER_SIDE} per side")]
    LevelCount { bids: usize, asks: usize },
    #[error("update received before snapshot")]
    MissingSnapshot,
}

/// Per-frame derived microstructure features.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookFeatures {
    pub mid_price: f64,
    pub volume_imbalance: [f64; NUM_DEPTHS],
    pub order_imbalance: [f64; NUM_DEPTHS],
    pub bid_vwap_disp: [f64; NUM_DEPTHS],
    pub ask_vwap_disp: [f64; NUM_DEPTHS],
}

impl BookFeatures {
    /// Flatten in wire order: per depth (VI, OI, bid disp, ask disp).
    pub fn flat(&self) -> [f64; NUM_DEPTHS * NUM_FEATURES] {
        let mut out = [0.0; NUM_DEPTHS * NUM_FEATURES];
        for d in 0..NUM_DEPTHS {
            out[d * NUM_FEATURES] = self.volume_imbalance[d];
            out[d * NUM_FEATURES + 1] = self.order_imbalance[d];
            out[d * NUM_FEATURES + 2] = self.bid_vwap_disp[d];
            out[d * NUM_FEATURES + 3] = self.ask_vwap_disp[d];
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct DepthBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    has_snapshot: bool,
    bid_history: VecDeque<Vec<BookLevel>>,
    ask_history: VecDeque<Vec<BookLevel>>,
}

/// Parse one raw level row: [price, size, <deprecated>, order_count],
/// all decimal strings (sign and exponent accepted). Short or malformed
/// rows yield None and are skipped by the caller.
pub fn parse_level(row: &[String]) -> Option<BookLevel> {
    if row.len() < 4 {
        return None;
    }
    let price = row[0].parse::<f64>().ok()?;
    let volume = row[1].parse::<f64>().ok()?;
    let orders = row[3].parse::<f64>().ok()?;
    Some(BookLevel { price, volume, orders })
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

impl DepthBook {
    pub fn new() -> Self {
        Self {
            bids: Vec::with_capacity(LEVELS_PER_SIDE),
            asks: Vec::with_capacity(LEVELS_PER_SIDE),
            has_snapshot: false,
            bid_history: VecDeque::with_capacity(HISTORY_SIZE),
            ask_history: VecDeque::with_capacity(HISTORY_SIZE),
        }
    }

    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    /// Rebuild both sides from a snapshot frame. Zero-size rows are
    /// discarded, never padded back; a side that does not end up with
    /// exactly 400 levels is a fatal state error.
    pub fn apply_snapshot(
        &mut self,
        bids: impl Iterator<Item = BookLevel>,
        asks: impl Iterator<Item = BookLevel>,
    ) -> Result<(), BookError> {
        self.bids.clear();
        self.asks.clear();
        self.bid_history.clear();
        self.ask_history.clear();
        self.has_snapshot = false;

        self.bids.extend(bids.filter(|l| l.volume > 0.0));
        self.asks.extend(asks.filter(|l| l.volume > 0.0));
        self.bids.sort_by(|a, b| cmp_f64(b.price, a.price));
        self.asks.sort_by(|a, b| cmp_f64(a.price, b.price));

        self.validate()?;
        self.has_snapshot = true;
        self.push_history();
        Ok(())
    }

    /// Apply one differential update. On a level-count violation the book
    /// is left unusable (`has_snapshot` drops) and the session must be
    /// re-snapshotted.
    pub fn apply_update(
        &mut self,
        bids: impl Iterator<Item = BookLevel>,
        asks: impl Iterator<Item = BookLevel>,
    ) -> Result<(), BookError> {
        if !self.has_snapshot {
            return Err(BookError::MissingSnapshot);
        }

        for level in asks {
            Self::update_level(&mut self.asks, level, false);
        }
        for level in bids {
            Self::update_level(&mut self.bids, level, true);
        }

        if let Err(e) = self.validate() {
            self.has_snapshot = false;
            return Err(e);
        }
        self.push_history();
        Ok(())
    }

    /// Locate `level.price` by binary search in the side's own ordering;
    /// remove on zero size, overwrite on a match, insert otherwise.
    fn update_level(side: &mut Vec<BookLevel>, level: BookLevel, is_bids: bool) {
        let found = side.binary_search_by(|probe| {
            if is_bids {
                // bids are sorted descending
                cmp_f64(level.price, probe.price)
            } else {
                cmp_f64(probe.price, level.price)
            }
        });
        match found {
            Ok(i) => {
                if level.volume <= 0.0 {
                    side.remove(i);
                } else {
                    side[i].volume = level.volume;
                    side[i].orders = level.orders;
                }
            }
            Err(i) => {
                if level.volume > 0.0 {
                    side.insert(i, level);
                }
            }
        }
    }

    fn validate(&self) -> Result<(), BookError> {
        if self.bids.len() != LEVELS_PER_SIDE || self.asks.len() != LEVELS_PER_SIDE {
            warn!(
                bids = self.bids.len(),
                asks = self.asks.len(),
                "level-count invariant violated"
            );
            return Err(BookError::LevelCount {
                bids: self.bids.len(),
                asks: self.asks.len(),
            });
        }
        Ok(())
    }

    fn push_history(&mut self) {
        self.bid_history.push_back(self.bids.clone());
        if self.bid_history.len() > HISTORY_SIZE {
            self.bid_history.pop_front();
        }
        self.ask_history.push_back(self.asks.clone());
        if self.ask_history.len() > HISTORY_SIZE {
            self.ask_history.pop_front();
        }
    }

    pub fn mid_price(&self) -> f64 {
        if self.bids.is_empty() || self.asks.is_empty() {
            return 0.0;
        }
        (self.bids[0].price + self.asks[0].price) / 2.0
    }

    fn volume_imbalance(&self, depth: usize) -> f64 {
        let bid: f64 = self.bids.iter().take(depth).map(|l| l.volume).sum();
        let ask: f64 = self.asks.iter().take(depth).map(|l| l.volume).sum();
        let total = bid + ask;
        if total > 0.0 {
            (bid - ask) / total
        } else {
            0.0
        }
    }

    fn order_imbalance(&self, depth: usize) -> f64 {
        let bid: f64 = self.bids.iter().take(depth).map(|l| l.orders).sum();
        let ask: f64 = self.asks.iter().take(depth).map(|l| l.orders).sum();
        let total = bid + ask;
        if total > 0.0 {
            (bid - ask) / total
        } else {
            0.0
        }
    }

    fn vwap(&self, depth: usize, is_bids: bool) -> f64 {
        let side = if is_bids { &self.bids } else { &self.asks };
        let mut volume = 0.0;
        let mut weighted = 0.0;
        for level in side.iter().take(depth) {
            volume += level.volume;
            weighted += level.price * level.volume;
        }
        if volume > 0.0 {
            weighted / volume
        } else {
            0.0
        }
    }

    pub fn features(&self) -> BookFeatures {
        let mut features = BookFeatures {
            mid_price: self.mid_price(),
            ..Default::default()
        };
        for (i, &depth) in DEPTH_CUTOFFS.iter().enumerate() {
            features.volume_imbalance[i] = self.volume_imbalance(depth);
            features.order_imbalance[i] = self.order_imbalance(depth);
            let bid_vwap = self.vwap(depth, true);
            let ask_vwap = self.vwap(depth, false);
            if features.mid_price > 0.0 {
                features.bid_vwap_disp[i] = (bid_vwap - features.mid_price) / features.mid_price;
                features.ask_vwap_disp[i] = (ask_vwap - features.mid_price) / features.mid_price;
            }
        }
        features
    }
}
