use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Daily OHLCV bar for one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Trading session the bar belongs to
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order lifecycle status
///
/// PENDING -> REPORTED -> {PARTIALLY_FILLED <-> REPORTED} -> FILLED | CANCELLED | REJECTED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Reported,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether an acknowledgement may move an order from `self` to `next`.
    ///
    /// Terminal states never move. Nothing moves back to PENDING once reported.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Pending => *self == OrderStatus::Pending,
            _ => true,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Reported => "REPORTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", name)
    }
}

/// Order tracked by the lifecycle monitor
///
/// `seq` is assigned locally at submission, `order_id` by the venue on
/// acknowledgement. Either may be missing depending on which event was seen first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub seq: Option<u64>,
    pub order_id: Option<String>,
    pub instrument: String,
    pub side: Option<Side>,
    pub quantity: u64,
    /// 0.0 means "at best / market"
    pub price: f64,
    pub remark: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub filled_quantity: u64,
    /// Set once `register` has been called for this order
    pub registered: bool,
    /// Set once the venue has acknowledged this order at least once
    pub acknowledged: bool,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Execution report for part (or all) of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub quantity: u64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// Holding in one instrument as reported by the execution gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub quantity: u64,
    /// Unencumbered quantity, never above `quantity`
    pub available: u64,
    pub cost_basis: f64,
    pub market_value: f64,
}

/// Cash and valuation snapshot of the single trading account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub cash: f64,
    pub market_value: f64,
    pub total_asset: f64,
}

/// Instrument proposed by the selection service with its attractiveness score
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub instrument: String,
    pub score: f64,
}

impl Candidate {
    pub fn new(instrument: impl Into<String>, score: f64) -> Self {
        Self {
            instrument: instrument.into(),
            score,
        }
    }
}

/// How much to buy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderSize {
    /// Share count, rounded down to whole board lots by the venue
    Shares(u64),
    /// Cash amount to spend, converted to whole lots at the venue price
    Value(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RiskTrigger {
    VolatilityStop,
    MeanReversionExit,
    LimitUpBroken,
}

/// Exit produced by one risk pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskEvent {
    pub instrument: String,
    pub trigger: RiskTrigger,
    pub trigger_price: f64,
    pub cash_released: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Reported));
        assert!(OrderStatus::Reported.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Reported));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Rejected));
        assert!(!OrderStatus::Reported.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Filled.can_transition_to(OrderStatus::Reported));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OrderStatus::PartiallyFilled.to_string(), "PARTIALLY_FILLED");
        assert_eq!(Side::Sell.to_string(), "SELL");
    }
}
