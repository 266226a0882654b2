use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::adapter::{
    self, order_type_code, status_code, VenueAssetPayload, VenueId, VenueOrderPayload,
    VenuePositionPayload, VenueTradePayload, OFFSET_FLAG_BUY,
};
use super::gateway::{ExecutionGateway, VenueCallbacks};
use crate::market_data::CandleStore;
use crate::models::{AccountInfo, OrderSize, OrderStatus, Position, Side};
use crate::{BotError, Result};

const OFFSET_FLAG_SELL: i32 = 49;
const FIRST_ORDER_ID: u64 = 100_001;

#[derive(Debug, Clone)]
struct PaperHolding {
    quantity: u64,
    available: u64,
    cost_basis: f64,
}

struct PaperAccount {
    cash: f64,
    holdings: HashMap<String, PaperHolding>,
    date: NaiveDate,
    rejected: HashSet<String>,
    /// Venue order ids handed out so far
    order_ids: HashSet<u64>,
}

/// Venue message produced while the account lock is held, delivered after it is released
enum Outbound {
    Order(VenueOrderPayload),
    Trade(VenueTradePayload),
    Error(String),
}

/// Simulated venue filling every order at the session close
///
/// Callbacks are pushed through the venue payload adapter before `buy` or
/// `sell` returns, so callers see acknowledgements ahead of their own
/// registration. Bought shares only become sellable after [`settle`].
///
/// [`settle`]: PaperGateway::settle
pub struct PaperGateway {
    prices: CandleStore,
    callbacks: Arc<dyn VenueCallbacks>,
    account: Mutex<PaperAccount>,
    lot_size: u64,
    next_seq: AtomicU64,
    next_order_id: AtomicU64,
    connected: AtomicBool,
}

impl PaperGateway {
    pub fn new(
        prices: CandleStore,
        callbacks: Arc<dyn VenueCallbacks>,
        initial_cash: f64,
        lot_size: u64,
        date: NaiveDate,
    ) -> Self {
        Self {
            prices,
            callbacks,
            account: Mutex::new(PaperAccount {
                cash: initial_cash,
                holdings: HashMap::new(),
                date,
                rejected: HashSet::new(),
                order_ids: HashSet::new(),
            }),
            lot_size: lot_size.max(1),
            next_seq: AtomicU64::new(1),
            next_order_id: AtomicU64::new(FIRST_ORDER_ID),
            connected: AtomicBool::new(false),
        }
    }

    fn account(&self) -> Result<MutexGuard<'_, PaperAccount>> {
        self.account
            .lock()
            .map_err(|e| BotError::AccountUnavailable(format!("paper account lock poisoned: {}", e)))
    }

    /// Move the session the venue prices against
    pub fn set_date(&self, date: NaiveDate) -> Result<()> {
        self.account()?.date = date;
        Ok(())
    }

    pub fn current_date(&self) -> Result<NaiveDate> {
        Ok(self.account()?.date)
    }

    /// Make every held share available (start of a new session)
    pub fn settle(&self) -> Result<()> {
        let mut account = self.account()?;
        for holding in account.holdings.values_mut() {
            holding.available = holding.quantity;
        }
        Ok(())
    }

    /// Orders for `instrument` will be rejected from now on
    pub fn reject_instrument(&self, instrument: &str) -> Result<()> {
        self.account()?.rejected.insert(instrument.to_string());
        Ok(())
    }

    /// Seed a settled holding, bypassing the order flow
    pub fn seed_position(&self, instrument: &str, quantity: u64, cost_basis: f64) -> Result<()> {
        self.account()?.holdings.insert(
            instrument.to_string(),
            PaperHolding {
                quantity,
                available: quantity,
                cost_basis,
            },
        );
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BotError::GatewayUnavailable("paper venue not connected".to_string()))
        }
    }

    fn execution_price(&self, instrument: &str, price: f64, date: NaiveDate) -> Result<f64> {
        if price > 0.0 {
            return Ok(price);
        }
        self.prices
            .close_on(instrument, date)?
            .filter(|p| *p > 0.0)
            .ok_or_else(|| {
                BotError::MarketDataUnavailable(format!("no price for {} on {}", instrument, date))
            })
    }

    fn round_to_lot(&self, quantity: u64) -> u64 {
        quantity / self.lot_size * self.lot_size
    }

    fn allocate_order_id(&self, account: &mut PaperAccount) -> u64 {
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        account.order_ids.insert(order_id);
        order_id
    }

    /// Deliver venue messages through the adapter, outside the account lock
    fn deliver(&self, messages: Vec<Outbound>) {
        for message in messages {
            match message {
                Outbound::Order(payload) => match adapter::normalize_order(payload) {
                    Ok(report) => self.callbacks.on_acknowledged(report),
                    Err(e) => self.callbacks.on_error(e.to_string()),
                },
                Outbound::Trade(payload) => match adapter::normalize_trade(payload) {
                    Ok(fill) => self.callbacks.on_fill(fill),
                    Err(e) => self.callbacks.on_error(e.to_string()),
                },
                Outbound::Error(message) => self.callbacks.on_error(message),
            }
        }
    }

    fn rejection(
        &self,
        account: &mut PaperAccount,
        seq: u64,
        instrument: &str,
        side: Side,
        quantity: u64,
        reason: &str,
    ) -> Vec<Outbound> {
        let order_id = self.allocate_order_id(account);
        tracing::warn!(seq, instrument, side = %side, quantity, reason, "Paper venue rejected order");
        vec![
            Outbound::Order(order_payload(order_id, seq, instrument, side, quantity, OrderStatus::Rejected)),
            Outbound::Error(format!("{} {} {}: {}", side, quantity, instrument, reason)),
        ]
    }

    fn filled(
        &self,
        account: &mut PaperAccount,
        seq: u64,
        instrument: &str,
        side: Side,
        quantity: u64,
        price: f64,
    ) -> Vec<Outbound> {
        let order_id = self.allocate_order_id(account);
        vec![
            Outbound::Order(order_payload(order_id, seq, instrument, side, quantity, OrderStatus::Reported)),
            Outbound::Trade(VenueTradePayload {
                order_id: VenueId::Number(order_id),
                stock_code: instrument.to_string(),
                traded_price: price,
                traded_volume: quantity,
                traded_amount: Some(price * quantity as f64),
                offset_flag: Some(match side {
                    Side::Buy => OFFSET_FLAG_BUY,
                    Side::Sell => OFFSET_FLAG_SELL,
                }),
                order_type: Some(order_type_code(side)),
            }),
            Outbound::Order(order_payload(order_id, seq, instrument, side, quantity, OrderStatus::Filled)),
        ]
    }
}

fn order_payload(
    order_id: u64,
    seq: u64,
    instrument: &str,
    side: Side,
    quantity: u64,
    status: OrderStatus,
) -> VenueOrderPayload {
    VenueOrderPayload {
        order_id: VenueId::Number(order_id),
        request_seq: Some(seq),
        stock_code: instrument.to_string(),
        order_status: status_code(status),
        order_type: Some(order_type_code(side)),
        order_volume: Some(quantity),
        order_remark: "paper".to_string(),
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn connect(&self) -> Result<bool> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("🔌 Connected to paper venue");
        Ok(true)
    }

    async fn buy(&self, instrument: &str, price: f64, size: OrderSize) -> Result<u64> {
        self.ensure_connected()?;

        let (seq, messages) = {
            let mut account = self.account()?;
            let exec_price = self.execution_price(instrument, price, account.date)?;

            let quantity = match size {
                OrderSize::Shares(shares) => self.round_to_lot(shares),
                OrderSize::Value(target) => {
                    let spend = target.min(account.cash).max(0.0);
                    self.round_to_lot((spend / exec_price).floor() as u64)
                }
            };
            if quantity == 0 {
                return Err(BotError::OrderRejected(format!(
                    "buy {} below one lot of {} shares",
                    instrument, self.lot_size
                )));
            }

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let cost = exec_price * quantity as f64;

            let messages = if account.rejected.contains(instrument) {
                self.rejection(&mut account, seq, instrument, Side::Buy, quantity, "instrument not tradable")
            } else if cost > account.cash + 1e-6 {
                self.rejection(&mut account, seq, instrument, Side::Buy, quantity, "insufficient cash")
            } else {
                account.cash -= cost;
                let holding = account
                    .holdings
                    .entry(instrument.to_string())
                    .or_insert(PaperHolding {
                        quantity: 0,
                        available: 0,
                        cost_basis: 0.0,
                    });
                let total = holding.quantity + quantity;
                holding.cost_basis =
                    (holding.cost_basis * holding.quantity as f64 + cost) / total as f64;
                holding.quantity = total;

                tracing::debug!(seq, instrument, quantity, price = exec_price, "Paper buy filled");
                self.filled(&mut account, seq, instrument, Side::Buy, quantity, exec_price)
            };
            (seq, messages)
        };

        self.deliver(messages);
        Ok(seq)
    }

    async fn sell(&self, instrument: &str, price: f64, quantity: Option<u64>) -> Result<u64> {
        self.ensure_connected()?;

        let (seq, messages) = {
            let mut account = self.account()?;
            let exec_price = self.execution_price(instrument, price, account.date)?;

            let available = account
                .holdings
                .get(instrument)
                .map(|h| h.available)
                .unwrap_or(0);
            let quantity = quantity.unwrap_or(available);
            if quantity == 0 {
                return Err(BotError::OrderRejected(format!(
                    "nothing available to sell for {}",
                    instrument
                )));
            }

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

            let messages = if account.rejected.contains(instrument) {
                self.rejection(&mut account, seq, instrument, Side::Sell, quantity, "instrument not tradable")
            } else if quantity > available {
                self.rejection(&mut account, seq, instrument, Side::Sell, quantity, "insufficient available position")
            } else {
                account.cash += exec_price * quantity as f64;
                let emptied = match account.holdings.get_mut(instrument) {
                    Some(holding) => {
                        holding.quantity -= quantity;
                        holding.available -= quantity;
                        holding.quantity == 0
                    }
                    None => false,
                };
                if emptied {
                    account.holdings.remove(instrument);
                }

                tracing::debug!(seq, instrument, quantity, price = exec_price, "Paper sell filled");
                self.filled(&mut account, seq, instrument, Side::Sell, quantity, exec_price)
            };
            (seq, messages)
        };

        self.deliver(messages);
        Ok(seq)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        self.ensure_connected()?;
        let known = order_id
            .parse::<u64>()
            .map(|id| self.account().map(|a| a.order_ids.contains(&id)))
            .unwrap_or(Ok(false))?;

        // Paper orders fill on submission, so there is never anything left to cancel
        if known {
            tracing::info!(order_id, "Cancel ignored, paper order already final");
        } else {
            tracing::warn!(order_id, "Cancel requested for unknown order");
        }
        Ok(false)
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        self.ensure_connected()?;
        let account = self.account()?;

        let mut positions = Vec::with_capacity(account.holdings.len());
        for (instrument, holding) in &account.holdings {
            let last = self
                .prices
                .close_on(instrument, account.date)?
                .unwrap_or(holding.cost_basis);
            positions.push(adapter::normalize_position(VenuePositionPayload {
                stock_code: instrument.clone(),
                volume: holding.quantity,
                can_use_volume: holding.available,
                open_price: holding.cost_basis,
                market_value: last * holding.quantity as f64,
            }));
        }
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(positions)
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        self.ensure_connected()?;
        let cash = self.account()?.cash;
        let market_value: f64 = self.positions().await?.iter().map(|p| p.market_value).sum();

        Ok(adapter::normalize_asset(VenueAssetPayload {
            cash,
            market_value,
            total_asset: cash + market_value,
        }))
    }
}
