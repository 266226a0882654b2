//! Venue payload normalisation
//!
//! Venue callbacks and queries arrive with differently named fields depending
//! on the binding version. Every payload is decoded into one of the raw
//! structs below (aliases cover the known spellings) and mapped into the
//! core types here, before anything reaches the monitor or the rebalancer.

use serde::{Deserialize, Serialize};

use super::gateway::{FillReport, OrderReport};
use crate::models::{AccountInfo, OrderStatus, Position, Side};
use crate::{BotError, Result};

/// Trade direction code the venue uses for buys
pub const OFFSET_FLAG_BUY: i32 = 48;
pub const ORDER_TYPE_BUY: i32 = 23;
pub const ORDER_TYPE_SELL: i32 = 24;

/// Identifier that may be sent as a number or a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VenueId {
    Number(u64),
    Text(String),
}

impl VenueId {
    fn into_string(self) -> String {
        match self {
            VenueId::Number(n) => n.to_string(),
            VenueId::Text(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrderPayload {
    #[serde(alias = "orderId", alias = "order_sysid")]
    pub order_id: VenueId,
    #[serde(default, alias = "seq", alias = "order_seq")]
    pub request_seq: Option<u64>,
    #[serde(alias = "instrument", alias = "symbol", alias = "code")]
    pub stock_code: String,
    #[serde(alias = "status", alias = "orderStatus")]
    pub order_status: i64,
    #[serde(default, alias = "side")]
    pub order_type: Option<i32>,
    #[serde(default, alias = "volume", alias = "quantity")]
    pub order_volume: Option<u64>,
    #[serde(default, alias = "remark", alias = "strategy_remark")]
    pub order_remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueTradePayload {
    #[serde(alias = "orderId", alias = "order_sysid")]
    pub order_id: VenueId,
    #[serde(alias = "instrument", alias = "symbol", alias = "code")]
    pub stock_code: String,
    #[serde(alias = "price")]
    pub traded_price: f64,
    #[serde(alias = "volume", alias = "quantity")]
    pub traded_volume: u64,
    #[serde(default, alias = "amount")]
    pub traded_amount: Option<f64>,
    #[serde(default, alias = "direction")]
    pub offset_flag: Option<i32>,
    #[serde(default, alias = "side")]
    pub order_type: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePositionPayload {
    #[serde(alias = "instrument", alias = "symbol", alias = "code")]
    pub stock_code: String,
    #[serde(alias = "m_nVolume", alias = "quantity")]
    pub volume: u64,
    #[serde(alias = "m_nCanUseVolume", alias = "available")]
    pub can_use_volume: u64,
    #[serde(alias = "m_dOpenPrice", alias = "avg_price", alias = "cost_basis")]
    pub open_price: f64,
    #[serde(alias = "m_dMarketValue")]
    pub market_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueAssetPayload {
    #[serde(alias = "m_dCash", alias = "available_cash")]
    pub cash: f64,
    #[serde(alias = "m_dMarketValue")]
    pub market_value: f64,
    #[serde(alias = "m_dTotalAsset")]
    pub total_asset: f64,
}

/// Map a venue status code to the lifecycle status
pub fn status_from_code(code: i64) -> Result<OrderStatus> {
    match code {
        0 | 1 => Ok(OrderStatus::Pending),
        2 | 4 => Ok(OrderStatus::Reported),
        3 => Ok(OrderStatus::PartiallyFilled),
        5 | 6 => Ok(OrderStatus::Cancelled),
        7 => Ok(OrderStatus::Filled),
        8 => Ok(OrderStatus::Rejected),
        other => Err(BotError::InvalidPayload(format!("unknown order status code {}", other))),
    }
}

/// Inverse of [`status_from_code`] for the canonical codes
pub fn status_code(status: OrderStatus) -> i64 {
    match status {
        OrderStatus::Pending => 0,
        OrderStatus::Reported => 2,
        OrderStatus::PartiallyFilled => 3,
        OrderStatus::Cancelled => 5,
        OrderStatus::Filled => 7,
        OrderStatus::Rejected => 8,
    }
}

fn side_from_order_type(order_type: i32) -> Option<Side> {
    match order_type {
        ORDER_TYPE_BUY => Some(Side::Buy),
        ORDER_TYPE_SELL => Some(Side::Sell),
        _ => None,
    }
}

pub fn order_type_code(side: Side) -> i32 {
    match side {
        Side::Buy => ORDER_TYPE_BUY,
        Side::Sell => ORDER_TYPE_SELL,
    }
}

pub fn normalize_order(payload: VenueOrderPayload) -> Result<OrderReport> {
    let order_id = payload.order_id.into_string();
    if order_id.is_empty() {
        return Err(BotError::InvalidPayload("order report without order id".to_string()));
    }

    Ok(OrderReport {
        order_id,
        seq: payload.request_seq,
        instrument: payload.stock_code,
        side: payload.order_type.and_then(side_from_order_type),
        requested_quantity: payload.order_volume,
        status: status_from_code(payload.order_status)?,
        remark: payload.order_remark,
    })
}

pub fn normalize_trade(payload: VenueTradePayload) -> Result<FillReport> {
    let order_id = payload.order_id.into_string();

    let side = match (payload.offset_flag, payload.order_type) {
        (Some(flag), _) if flag == OFFSET_FLAG_BUY => Side::Buy,
        (Some(_), _) => Side::Sell,
        (None, Some(order_type)) => side_from_order_type(order_type).ok_or_else(|| {
            BotError::InvalidPayload(format!("unknown order type {} on trade {}", order_type, order_id))
        })?,
        (None, None) => {
            return Err(BotError::InvalidPayload(format!(
                "trade {} carries no direction",
                order_id
            )))
        }
    };

    if !payload.traded_price.is_finite() || payload.traded_price < 0.0 {
        return Err(BotError::InvalidPayload(format!(
            "trade {} has invalid price {}",
            order_id, payload.traded_price
        )));
    }

    let amount = payload
        .traded_amount
        .filter(|a| a.is_finite() && *a > 0.0)
        .unwrap_or(payload.traded_price * payload.traded_volume as f64);

    Ok(FillReport {
        order_id,
        instrument: payload.stock_code,
        side,
        price: payload.traded_price,
        quantity: payload.traded_volume,
        amount,
    })
}

pub fn normalize_position(payload: VenuePositionPayload) -> Position {
    Position {
        instrument: payload.stock_code,
        quantity: payload.volume,
        available: payload.can_use_volume.min(payload.volume),
        cost_basis: payload.open_price,
        market_value: payload.market_value,
    }
}

pub fn normalize_asset(payload: VenueAssetPayload) -> AccountInfo {
    AccountInfo {
        cash: payload.cash,
        market_value: payload.market_value,
        total_asset: payload.total_asset,
    }
}
