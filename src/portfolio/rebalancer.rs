use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::allocation::allocate;
use crate::config::PortfolioConfig;
use crate::execution::{ExecutionGateway, OrderMonitor};
use crate::market_data::{latest_bar, trailing_bars, MarketData};
use crate::models::{Candidate, Candle, OrderSize, Position, RiskEvent, RiskTrigger, Side};
use crate::risk::RiskController;
use crate::Result;

/// Outcome of one `rebalance` call
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalanceSummary {
    pub sold: Vec<String>,
    pub bought: Vec<String>,
    /// Buys not attempted (below one lot, no price)
    pub skipped: Vec<String>,
    /// Orders the gateway refused
    pub failed: Vec<String>,
    pub cash_released: f64,
    /// Breadth gate forced a full liquidation
    pub liquidated: bool,
}

/// Outcome of a risk pass or a limit-up pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskSummary {
    pub events: Vec<RiskEvent>,
    pub cash_released: f64,
    pub failed: Vec<String>,
    pub reinvestment: ReinvestSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReinvestSummary {
    pub bought: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

enum BuyOutcome {
    Submitted,
    Skipped,
}

/// The only component that issues orders
///
/// Every submission is registered with the order monitor right after the
/// gateway returns its sequence number. Cash freed by a sell is counted as
/// soon as the sell is submitted, not when it fills.
pub struct PortfolioRebalancer {
    gateway: Arc<dyn ExecutionGateway>,
    monitor: OrderMonitor,
    risk: RiskController,
    market_data: Arc<dyn MarketData>,
    config: PortfolioConfig,
    /// Target list of the latest rebalance, reused for reinvestment
    candidates: Vec<Candidate>,
    /// Holdings that closed limit-up on the previous session
    limit_up_exempt: HashSet<String>,
}

impl PortfolioRebalancer {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        monitor: OrderMonitor,
        risk: RiskController,
        market_data: Arc<dyn MarketData>,
        config: PortfolioConfig,
    ) -> Self {
        Self {
            gateway,
            monitor,
            risk,
            market_data,
            config,
            candidates: Vec::new(),
            limit_up_exempt: HashSet::new(),
        }
    }

    pub fn monitor(&self) -> &OrderMonitor {
        &self.monitor
    }

    pub fn risk(&self) -> &RiskController {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut RiskController {
        &mut self.risk
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn set_candidates(&mut self, candidates: Vec<Candidate>) {
        self.candidates = candidates;
    }

    /// Current exemption set, sorted
    pub fn limit_up_exemptions(&self) -> Vec<String> {
        let mut exempt: Vec<String> = self.limit_up_exempt.iter().cloned().collect();
        exempt.sort();
        exempt
    }

    pub fn exempt_from_liquidation(&mut self, instrument: &str) {
        self.limit_up_exempt.insert(instrument.to_string());
    }

    /// Whether the index timing gate allows new positions
    pub async fn market_timing_open(&self, as_of: NaiveDate) -> bool {
        self.risk.market_timing_open(as_of).await
    }

    /// Reconcile holdings with the target list
    ///
    /// Fails only when account or position state cannot be read, before any
    /// order is sent. Individual order failures are logged and collected.
    pub async fn rebalance(&mut self, targets: &[Candidate], as_of: NaiveDate) -> Result<RebalanceSummary> {
        let positions = self.gateway.positions().await?;
        let account = self.gateway.account_info().await?;
        let mut summary = RebalanceSummary::default();

        tracing::info!(
            %as_of,
            holdings = positions.len(),
            targets = targets.len(),
            cash = account.cash,
            "🔄 Rebalancing portfolio"
        );

        let risk_config = self.risk.config().clone();
        let breadth = self.risk.market_breadth(risk_config.breadth_period, as_of).await;
        if breadth < risk_config.breadth_threshold {
            tracing::warn!(
                breadth,
                threshold = risk_config.breadth_threshold,
                "📉 Market breadth too weak, liquidating every holding"
            );
            for position in &positions {
                match self.sell_position(position, "breadth liquidation").await {
                    Ok(()) => {
                        summary.sold.push(position.instrument.clone());
                        summary.cash_released += position.market_value;
                    }
                    Err(_) => summary.failed.push(position.instrument.clone()),
                }
            }
            summary.liquidated = true;
            return Ok(summary);
        }

        self.candidates = targets.to_vec();
        let target_set: HashSet<&str> = targets.iter().map(|c| c.instrument.as_str()).collect();

        let mut still_held: HashSet<String> = HashSet::new();
        for position in &positions {
            let instrument = position.instrument.as_str();
            if target_set.contains(instrument) || self.limit_up_exempt.contains(instrument) {
                still_held.insert(position.instrument.clone());
                continue;
            }

            match self.sell_position(position, "not in target list").await {
                Ok(()) => {
                    summary.sold.push(position.instrument.clone());
                    summary.cash_released += position.market_value;
                }
                Err(_) => {
                    summary.failed.push(position.instrument.clone());
                    still_held.insert(position.instrument.clone());
                }
            }
        }

        let available_cash = account.cash + summary.cash_released;
        let slots = self.config.max_holdings.saturating_sub(still_held.len());
        let to_buy: Vec<Candidate> = targets
            .iter()
            .filter(|c| !still_held.contains(&c.instrument))
            .cloned()
            .collect();

        if to_buy.is_empty() || slots == 0 {
            tracing::info!(slots, "No new positions to open");
        } else {
            let outcome = self.buy_allocations(&to_buy, available_cash, slots, as_of, "rebalance").await;
            summary.bought = outcome.bought;
            summary.skipped = outcome.skipped;
            summary.failed.extend(outcome.failed);
        }

        tracing::info!(
            sold = summary.sold.len(),
            bought = summary.bought.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "✅ Rebalance complete"
        );
        Ok(summary)
    }

    /// Evaluate every open position for a volatility stop or a mean-reversion exit
    pub async fn check_risk_control(&mut self, as_of: NaiveDate) -> Result<RiskSummary> {
        let positions = self.gateway.positions().await?;
        self.gateway.account_info().await?;
        let mut summary = RiskSummary::default();
        let exit_threshold = self.risk.config().exit_threshold;

        for position in &positions {
            let instrument = position.instrument.as_str();
            if self.limit_up_exempt.contains(instrument) {
                continue;
            }

            let bar = match latest_bar(self.market_data.as_ref(), instrument, as_of).await {
                Ok(Some(bar)) => bar,
                Ok(None) => {
                    tracing::debug!(instrument, "No price, skipping risk check");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(instrument, error = %e, "Price unavailable, skipping risk check");
                    continue;
                }
            };

            let cost_basis = if position.cost_basis > 0.0 {
                position.cost_basis
            } else {
                bar.close
            };

            let stop = self
                .risk
                .check_stop_loss(instrument, bar.close, cost_basis, as_of)
                .await;
            let trigger = match stop {
                Ok((true, level)) => {
                    tracing::info!(instrument, price = bar.close, level, "🛑 Volatility stop hit");
                    Some(RiskTrigger::VolatilityStop)
                }
                Ok((false, _)) => match self.risk.position_signal(instrument, as_of).await {
                    Ok(signal) if signal < exit_threshold => {
                        tracing::info!(instrument, signal, threshold = exit_threshold, "📉 Mean-reversion exit");
                        Some(RiskTrigger::MeanReversionExit)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(instrument, error = %e, "Signal unavailable");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(instrument, error = %e, "Stop check failed");
                    continue;
                }
            };

            match trigger {
                Some(trigger) => {
                    self.exit_position(position, trigger, bar.close, &mut summary).await;
                }
                None => {
                    self.risk.update_peak(instrument, bar.high, cost_basis);
                }
            }
        }

        self.reinvest_released(&positions, &mut summary, as_of).await;
        Ok(summary)
    }

    /// Sell exempt holdings whose limit-up has opened
    pub async fn handle_limit_up_instruments(&mut self, as_of: NaiveDate) -> Result<RiskSummary> {
        let positions = self.gateway.positions().await?;
        self.gateway.account_info().await?;
        let mut summary = RiskSummary::default();

        let mut exempt: Vec<String> = self.limit_up_exempt.iter().cloned().collect();
        exempt.sort();

        for instrument in exempt {
            let Some(position) = positions.iter().find(|p| p.instrument == instrument) else {
                tracing::debug!(instrument = %instrument, "No longer held, dropping exemption");
                self.limit_up_exempt.remove(&instrument);
                continue;
            };

            let bars = match trailing_bars(self.market_data.as_ref(), &instrument, as_of, 2).await {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(instrument = %instrument, error = %e, "Price unavailable, keeping exemption");
                    continue;
                }
            };
            let [prev, today] = bars.as_slice() else {
                continue;
            };
            if today.date() != as_of {
                tracing::debug!(instrument = %instrument, "No session bar yet, keeping exemption");
                continue;
            }

            if self.is_limit_up(prev, today) {
                tracing::info!(instrument = %instrument, close = today.close, "Still at limit-up, holding");
                continue;
            }

            tracing::info!(instrument = %instrument, close = today.close, high = today.high, "🔓 Limit-up opened, selling");
            if self
                .exit_position(position, RiskTrigger::LimitUpBroken, today.close, &mut summary)
                .await
            {
                self.limit_up_exempt.remove(&instrument);
            }
        }

        self.reinvest_released(&positions, &mut summary, as_of).await;
        Ok(summary)
    }

    /// Recompute the exemption set from the session before `as_of`
    ///
    /// The previous session is the index proxy's latest bar before `as_of`,
    /// or the newest bar among the holdings when the index has none. A
    /// holding only qualifies when its own last bar is that session, so a
    /// suspended instrument is never exempted on an old limit-up.
    pub async fn refresh_limit_up_exemptions(&mut self, as_of: NaiveDate) -> Result<Vec<String>> {
        let positions = self.gateway.positions().await?;
        let prior_day = as_of - Duration::days(1);

        let mut recent = Vec::with_capacity(positions.len());
        for position in &positions {
            match trailing_bars(self.market_data.as_ref(), &position.instrument, prior_day, 2).await {
                Ok(bars) => recent.push((position.instrument.clone(), bars)),
                Err(e) => {
                    tracing::warn!(instrument = %position.instrument, error = %e, "Skipping limit-up check");
                }
            }
        }

        let index_proxy = self.risk.config().index_proxy.clone();
        let index_session = match latest_bar(self.market_data.as_ref(), &index_proxy, prior_day).await {
            Ok(bar) => bar.map(|b| b.date()),
            Err(e) => {
                tracing::debug!(index = %index_proxy, error = %e, "Index bar unavailable for session check");
                None
            }
        };
        let previous_session = index_session.or_else(|| {
            recent
                .iter()
                .filter_map(|(_, bars)| bars.last().map(|b| b.date()))
                .max()
        });

        let mut exempt = HashSet::new();
        for (instrument, bars) in &recent {
            let [prev, last] = bars.as_slice() else {
                continue;
            };
            if Some(last.date()) != previous_session {
                tracing::debug!(instrument = %instrument, last_bar = %last.date(), "No bar for the previous session");
                continue;
            }
            if self.is_limit_up(prev, last) {
                exempt.insert(instrument.clone());
            }
        }

        self.limit_up_exempt = exempt;
        let exempt = self.limit_up_exemptions();
        if !exempt.is_empty() {
            tracing::info!(instruments = ?exempt, "Limit-up holdings exempt from liquidation");
        }
        Ok(exempt)
    }

    /// Spend `cash` on candidates not currently held, at most `available_slots` of them
    ///
    /// Positions are read again so that sells filled in the meantime are reflected.
    pub async fn reinvest(
        &self,
        candidates: &[Candidate],
        cash: f64,
        available_slots: usize,
        as_of: NaiveDate,
    ) -> ReinvestSummary {
        if candidates.is_empty() || cash <= 0.0 || available_slots == 0 {
            return ReinvestSummary::default();
        }

        let held: HashSet<String> = match self.gateway.positions().await {
            Ok(positions) => positions.into_iter().map(|p| p.instrument).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Positions unavailable, skipping reinvestment");
                return ReinvestSummary::default();
            }
        };

        let to_buy: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !held.contains(&c.instrument))
            .cloned()
            .collect();
        if to_buy.is_empty() {
            return ReinvestSummary::default();
        }

        tracing::info!(cash, slots = available_slots, "💸 Reinvesting released cash");
        self.buy_allocations(&to_buy, cash, available_slots, as_of, "reinvest").await
    }

    async fn reinvest_released(&mut self, positions: &[Position], summary: &mut RiskSummary, as_of: NaiveDate) {
        if summary.cash_released <= 0.0 {
            return;
        }
        if !self.risk.market_timing_open(as_of).await {
            tracing::info!(cash = summary.cash_released, "Timing gate closed, released cash stays idle");
            return;
        }

        let remaining = positions.len().saturating_sub(summary.events.len());
        let slots = self.config.max_holdings.saturating_sub(remaining);
        let candidates = self.candidates.clone();
        summary.reinvestment = self.reinvest(&candidates, summary.cash_released, slots, as_of).await;
    }

    /// Sell a whole position after a risk trigger; returns whether the sell was submitted
    async fn exit_position(
        &mut self,
        position: &Position,
        trigger: RiskTrigger,
        trigger_price: f64,
        summary: &mut RiskSummary,
    ) -> bool {
        let remark = match trigger {
            RiskTrigger::VolatilityStop => "volatility stop",
            RiskTrigger::MeanReversionExit => "mean-reversion exit",
            RiskTrigger::LimitUpBroken => "limit-up opened",
        };

        match self.sell_position(position, remark).await {
            Ok(()) => {
                summary.cash_released += position.market_value;
                summary.events.push(RiskEvent {
                    instrument: position.instrument.clone(),
                    trigger,
                    trigger_price,
                    cash_released: position.market_value,
                });
                true
            }
            Err(_) => {
                summary.failed.push(position.instrument.clone());
                false
            }
        }
    }

    /// Close of `today` at its high and up at least `limit_up_pct` on `prev`
    fn is_limit_up(&self, prev: &Candle, today: &Candle) -> bool {
        if prev.close <= 0.0 {
            return false;
        }
        let pct_change = (today.close / prev.close - 1.0) * 100.0;
        (today.close - today.high).abs() <= self.config.price_tolerance
            && pct_change >= self.config.limit_up_pct
    }

    /// Sell the whole available quantity; a submitted sell closes the position's peak
    async fn sell_position(&mut self, position: &Position, remark: &str) -> Result<()> {
        match self.gateway.sell(&position.instrument, 0.0, None).await {
            Ok(seq) => {
                self.monitor
                    .register(seq, &position.instrument, Side::Sell, position.available, 0.0, remark);
                self.risk.clear_peak(&position.instrument);
                tracing::info!(instrument = %position.instrument, seq, quantity = position.available, remark, "Sell submitted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(instrument = %position.instrument, action = "sell", remark, error = %e, "❌ Sell failed");
                Err(e)
            }
        }
    }

    async fn buy_allocations(
        &self,
        candidates: &[Candidate],
        cash: f64,
        slots: usize,
        as_of: NaiveDate,
        remark: &str,
    ) -> ReinvestSummary {
        let mut outcome = ReinvestSummary::default();

        for allocation in allocate(candidates, cash, slots) {
            match self.buy_amount(&allocation.instrument, allocation.amount, as_of, remark).await {
                Ok(BuyOutcome::Submitted) => outcome.bought.push(allocation.instrument),
                Ok(BuyOutcome::Skipped) => outcome.skipped.push(allocation.instrument),
                Err(e) => {
                    tracing::error!(
                        instrument = %allocation.instrument,
                        action = "buy",
                        amount = allocation.amount,
                        error = %e,
                        "❌ Buy failed"
                    );
                    outcome.failed.push(allocation.instrument);
                }
            }
        }

        outcome
    }

    /// Buy whole lots worth at most `amount` at the latest close
    async fn buy_amount(&self, instrument: &str, amount: f64, as_of: NaiveDate, remark: &str) -> Result<BuyOutcome> {
        let Some(bar) = latest_bar(self.market_data.as_ref(), instrument, as_of).await? else {
            tracing::warn!(instrument, "No price, skipping buy");
            return Ok(BuyOutcome::Skipped);
        };
        let price = bar.close;
        let lot = self.config.lot_size.max(1);
        let min_amount = price * lot as f64;

        if price <= 0.0 || amount < min_amount {
            tracing::info!(
                instrument,
                amount = %format!("{:.2}", amount),
                min_amount = %format!("{:.2}", min_amount),
                "Allocation below one lot, skipping"
            );
            return Ok(BuyOutcome::Skipped);
        }

        let quantity = (amount / price / lot as f64).floor() as u64 * lot;
        let seq = self.gateway.buy(instrument, 0.0, OrderSize::Shares(quantity)).await?;
        self.monitor.register(seq, instrument, Side::Buy, quantity, 0.0, remark);

        tracing::info!(instrument, seq, quantity, price, "Buy submitted");
        Ok(BuyOutcome::Submitted)
    }
}
