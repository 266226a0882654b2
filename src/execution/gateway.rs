use async_trait::async_trait;

use crate::models::{AccountInfo, OrderSize, OrderStatus, Position, Side};
use crate::Result;

/// Normalised order acknowledgement delivered by the venue
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub order_id: String,
    /// Local sequence number, when the venue echoes it back
    pub seq: Option<u64>,
    pub instrument: String,
    pub side: Option<Side>,
    pub requested_quantity: Option<u64>,
    pub status: OrderStatus,
    pub remark: String,
}

/// Normalised execution report
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub quantity: u64,
    pub amount: f64,
}

/// Events the venue pushes back after submission
///
/// Implementations must be callable from any delivery thread.
pub trait VenueCallbacks: Send + Sync {
    fn on_acknowledged(&self, report: OrderReport);
    fn on_fill(&self, fill: FillReport);
    fn on_error(&self, message: String);
}

/// Thin binding to the execution venue
///
/// `buy` and `sell` return the locally generated sequence number as soon as
/// the request is handed to the venue; outcomes arrive through
/// [`VenueCallbacks`] only.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn connect(&self) -> Result<bool>;

    /// `price` of 0.0 means at best / latest price
    async fn buy(&self, instrument: &str, price: f64, size: OrderSize) -> Result<u64>;

    /// `quantity` of None sells everything available
    async fn sell(&self, instrument: &str, price: f64, quantity: Option<u64>) -> Result<u64>;

    async fn cancel(&self, order_id: &str) -> Result<bool>;

    async fn positions(&self) -> Result<Vec<Position>>;

    async fn account_info(&self) -> Result<AccountInfo>;
}
