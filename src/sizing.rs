// ===============================
// src/sizing.rs
// ===============================
//
// Pre-trade position sizing: caps the projected per-side exposure at a
// margin-derived maximum, shrinking or rejecting the requested size.

use thiserror::Error;

use crate::domain::{Side, Trade};

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("requested {requested} on {side:?} exceeds cap; {available} available is below the {min_contract} minimum")]
    InsufficientRoom {
        side: Side,
        requested: f64,
        available: f64,
        min_contract: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingDecision {
    pub size: f64,
    pub was_adjusted: bool,
}

/// An open order as the sizing policy sees it: side and intended volume.
#[derive(Debug, Clone, Copy)]
pub struct OpenExposure {
    pub side: Side,
    pub intended_volume: f64,
}

#[derive(Debug, Clone)]
pub struct SizingPolicy {
    pub margin_cap_percent: f64,
    pub leverage: f64,
    pub min_contract: f64,
}

impl SizingPolicy {
    pub fn new(margin_cap_percent: f64, leverage: f64, min_contract: f64) -> Self {
        Self {
            margin_cap_percent,
            leverage,
            min_contract,
        }
    }

    /// Maximum contracts allowed per side, floored to one decimal.
    pub fn max_per_side(&self, balance: f64, mid_price: f64) -> f64 {
        if mid_price <= 0.0 {
            return 0.0;
        }
        let raw = (balance * self.margin_cap_percent / 100.0) * self.leverage / (mid_price / 100.0);
        (raw * 10.0).floor() / 10.0
    }

    /// Validate a requested size against the per-side exposure that would
    /// exist if it filled completely. Overruns shrink the request; a
    /// shrunk size below the contract minimum is rejected outright.
    pub fn validate(
        &self,
        requested: f64,
        side: Side,
        balance: f64,
        mid_price: f64,
        current_trade: Option<&Trade>,
        open_orders: &[OpenExposure],
    ) -> Result<SizingDecision, SizingError> {
        let max_per_side = self.max_per_side(balance, mid_price);

        let mut exposure = 0.0;
        if let Some(trade) = current_trade {
            if let Some(direction) = trade.direction {
                if direction.entry_side() == side {
                    exposure += trade.net_size.abs();
                }
            }
        }
        for order in open_orders {
            if order.side == side {
                exposure += order.intended_volume;
            }
        }

        let projected = exposure + requested;
        if projected <= max_per_side {
            return Ok(SizingDecision { size: requested, was_adjusted: false });
        }

        let overrun = projected - max_per_side;
        let adjusted = requested - overrun;
        if adjusted < self.min_contract {
            return Err(SizingError::InsufficientRoom {
                side,
                requested,
                available: adjusted.max(0.0),
                min_contract: self.min_contract,
            });
        }
        Ok(SizingDecision { size: adjusted, was_adjusted: true })
    }
}
