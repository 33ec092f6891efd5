// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    /// Exchange wire spellings from the private orders channel.
    pub fn parse(s: &str) -> OrderState {
        match s {
            "live" => OrderState::Live,
            "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "mmp_canceled" => OrderState::Canceled,
            _ => OrderState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled | OrderState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn from_side(side: Side) -> TradeDirection {
        match side {
            Side::Buy => TradeDirection::Long,
            Side::Sell => TradeDirection::Short,
        }
    }

    pub fn entry_side(&self) -> Side {
        match self {
            TradeDirection::Long => Side::Buy,
            TradeDirection::Short => Side::Sell,
        }
    }
}

/// One slice of an exchange-reported fill, attributed to a trade. A fill
/// that flips the position decomposes into a closing and an opening portion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillPortion {
    pub trade_id: String,
    pub size: f64,
    pub price: f64,
    pub timestamp: i64,
    pub is_closing: bool,
    /// Fraction of the order's intended volume this portion represents, in [0, 1].
    pub execution_fraction: f64,
}

/// Our view of one submitted order. `local_id` is the state id of the
/// action that created it, which is also the client order id on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub local_id: u16,
    pub exchange_id: Option<String>,
    pub side: Side,
    pub intended_volume: f64,
    pub intended_price: f64,
    pub cumulative_filled: f64,
    pub avg_fill_price: f64,
    pub state: OrderState,
    pub trade_id: String,
    pub fill_portions: Vec<FillPortion>,
    pub fill_time: i64,
    pub execution_fraction: f64,
}

impl OrderRecord {
    pub fn new(local_id: u16, side: Side, volume: f64, price: f64) -> Self {
        Self {
            local_id,
            exchange_id: None,
            side,
            intended_volume: volume,
            intended_price: price,
            cumulative_filled: 0.0,
            avg_fill_price: 0.0,
            state: OrderState::Pending,
            trade_id: String::new(),
            fill_portions: Vec::new(),
            fill_time: 0,
            execution_fraction: 0.0,
        }
    }
}

/// A maximal run of fills from flat back to flat. `net_size` is signed:
/// positive long, negative short. The side-wise qp/qty running sums feed
/// the closure reward.
#[derive(Debug, Clone, Default)]
pub struct Trade {
    pub trade_id: String,
    pub direction: Option<TradeDirection>,
    pub net_size: f64,
    pub orders: Vec<OrderRecord>,
    pub buy_qp: f64,
    pub buy_qty: f64,
    pub sell_qp: f64,
    pub sell_qty: f64,
    pub cumulative_reward: f64,
    pub reduced_qty: f64,
}

impl Trade {
    pub fn open(trade_id: String, direction: TradeDirection, size: f64) -> Self {
        Trade {
            trade_id,
            direction: Some(direction),
            net_size: match direction {
                TradeDirection::Long => size,
                TradeDirection::Short => -size,
            },
            ..Default::default()
        }
    }

    pub fn avg_buy_price(&self) -> f64 {
        if self.buy_qty > 0.0 {
            self.buy_qp / self.buy_qty
        } else {
            0.0
        }
    }

    pub fn avg_sell_price(&self) -> f64 {
        if self.sell_qty > 0.0 {
            self.sell_qp / self.sell_qty
        } else {
            0.0
        }
    }

    pub fn add_side_fill(&mut self, side: Side, size: f64, price: f64) {
        match side {
            Side::Buy => {
                self.buy_qp += size * price;
                self.buy_qty += size;
            }
            Side::Sell => {
                self.sell_qp += size * price;
                self.sell_qty += size;
            }
        }
    }

    /// Net position recomputed from the fill portions tagged with this
    /// trade's id: sum of buy-side sizes minus sum of sell-side sizes.
    pub fn net_from_portions(&self) -> f64 {
        let mut net = 0.0;
        for order in &self.orders {
            for portion in &order.fill_portions {
                if portion.trade_id == self.trade_id {
                    net += order.side.sign() * portion.size;
                }
            }
        }
        net
    }
}

/// Execution-report JSON as consumed by the decision relay. Both flavours
/// (per-execution and trade-closure) share this shape; absent fields stay
/// None.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReportMsg {
    pub is_trade_closed: bool,
    #[serde(default)]
    pub state_id: Option<u32>,
    #[serde(default)]
    pub okx_id: Option<String>,
    #[serde(default)]
    pub execution_percentage: Option<f64>,
    #[serde(default)]
    pub filled_portions: Option<Vec<std::collections::HashMap<String, f64>>>,
    #[serde(default)]
    pub reward: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_and_state_parsing() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
        assert_eq!(Side::parse("short"), None);
        assert_eq!(OrderState::parse("partially_filled"), OrderState::PartiallyFilled);
        assert_eq!(OrderState::parse("filled"), OrderState::Filled);
        assert!(OrderState::Filled.is_terminal());
        assert!(!OrderState::Live.is_terminal());
    }

    #[test]
    fn trade_side_averages() {
        let mut trade = Trade::open("t1".into(), TradeDirection::Long, 0.0);
        assert_eq!(trade.avg_buy_price(), 0.0);
        trade.add_side_fill(Side::Buy, 1.0, 30000.0);
        trade.add_side_fill(Side::Buy, 1.0, 30100.0);
        trade.add_side_fill(Side::Sell, 0.5, 30500.0);
        assert!((trade.avg_buy_price() - 30050.0).abs() < 1e-9);
        assert!((trade.avg_sell_price() - 30500.0).abs() < 1e-9);
    }

    #[test]
    fn net_from_portions_is_signed_by_side() {
        let mut trade = Trade::open("t1".into(), TradeDirection::Long, 0.0);
        let mut buy = OrderRecord::new(2, Side::Buy, 1.0, 30000.0);
        buy.trade_id = "t1".into();
        buy.fill_portions.push(FillPortion {
            trade_id: "t1".into(),
            size: 1.0,
            price: 30000.0,
            timestamp: 1,
            is_closing: false,
            execution_fraction: 1.0,
        });
        let mut sell = OrderRecord::new(4, Side::Sell, 0.4, 30100.0);
        sell.trade_id = "t1".into();
        sell.fill_portions.push(FillPortion {
            trade_id: "t1".into(),
            size: 0.4,
            price: 30100.0,
            timestamp: 2,
            is_closing: true,
            execution_fraction: 1.0,
        });
        // a portion from some other trade must not count
        sell.fill_portions.push(FillPortion {
            trade_id: "other".into(),
            size: 5.0,
            price: 30100.0,
            timestamp: 3,
            is_closing: false,
            execution_fraction: 1.0,
        });
        trade.orders.push(buy);
        trade.orders.push(sell);
        assert!((trade.net_from_portions() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn execution_report_deserializes_both_flavours() {
        let per_exec: ExecutionReportMsg =
            serde_json::from_str(r#"{"state_id":7,"okx_id":"abc","is_trade_closed":false}"#)
                .unwrap();
        assert!(!per_exec.is_trade_closed);
        assert_eq!(per_exec.state_id, Some(7));
        assert_eq!(per_exec.okx_id.as_deref(), Some("abc"));
        assert!(per_exec.execution_percentage.is_none());

        let closure: ExecutionReportMsg = serde_json::from_str(
            r#"{"is_trade_closed":true,"filled_portions":[{"abc":100.0},{"def":33.3}],"reward":50.0}"#,
        )
        .unwrap();
        assert!(closure.is_trade_closed);
        assert_eq!(closure.reward, Some(50.0));
        assert_eq!(closure.filled_portions.as_ref().unwrap().len(), 2);
    }
}
