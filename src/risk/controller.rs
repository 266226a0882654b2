use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RiskConfig;
use crate::indicators::{calculate_atr, calculate_sma, mean_reversion_signal};
use crate::market_data::{trailing_bars, MarketData};
use crate::Result;

/// Breadth reported when no instrument in the universe has enough data
pub const NEUTRAL_BREADTH: f64 = 50.0;

/// Per-instrument exit signals and the market-wide timing gate
///
/// The only state is the running peak price of each open position.
pub struct RiskController {
    market_data: Arc<dyn MarketData>,
    config: RiskConfig,
    peaks: HashMap<String, f64>,
}

impl RiskController {
    pub fn new(market_data: Arc<dyn MarketData>, config: RiskConfig) -> Self {
        Self {
            market_data,
            config,
            peaks: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Seed the peak with `initial_price` on first sight, then ratchet it up
    pub fn update_peak(&mut self, instrument: &str, observed_high: f64, initial_price: f64) -> f64 {
        let peak = self
            .peaks
            .entry(instrument.to_string())
            .and_modify(|p| *p = p.max(observed_high))
            .or_insert(if initial_price > 0.0 {
                initial_price
            } else {
                observed_high
            });
        *peak
    }

    /// Running peak, 0.0 when never seeded
    pub fn peak(&self, instrument: &str) -> f64 {
        self.peaks.get(instrument).copied().unwrap_or(0.0)
    }

    pub fn clear_peak(&mut self, instrument: &str) {
        if self.peaks.remove(instrument).is_some() {
            tracing::debug!(instrument, "Cleared peak price");
        }
    }

    /// ATR over `period` daily bars ending at `as_of`, None when history is too short
    pub async fn average_true_range(
        &self,
        instrument: &str,
        period: usize,
        as_of: NaiveDate,
    ) -> Result<Option<f64>> {
        let bars = trailing_bars(self.market_data.as_ref(), instrument, as_of, period + 1).await?;
        Ok(calculate_atr(&bars, period))
    }

    /// Trailing volatility stop
    ///
    /// Returns `(triggered, level)` with `level = peak - multiplier * ATR`,
    /// floored at zero. Without a seeded peak or without enough history for
    /// the ATR nothing triggers and the level is 0.0.
    pub async fn check_stop_loss(
        &mut self,
        instrument: &str,
        current_price: f64,
        cost_basis: f64,
        as_of: NaiveDate,
    ) -> Result<(bool, f64)> {
        let peak = if !self.peaks.contains_key(instrument) && cost_basis > 0.0 {
            self.update_peak(instrument, cost_basis, cost_basis)
        } else {
            self.update_peak(instrument, current_price, 0.0)
        };

        if peak <= 0.0 {
            return Ok((false, 0.0));
        }

        let Some(atr) = self
            .average_true_range(instrument, self.config.atr_period, as_of)
            .await?
        else {
            tracing::debug!(instrument, "Not enough history for ATR, stop not evaluated");
            return Ok((false, 0.0));
        };

        let level = (peak - self.config.atr_multiplier * atr).max(0.0);
        let triggered = current_price <= level;

        if triggered {
            tracing::info!(
                instrument,
                price = current_price,
                peak,
                atr,
                level,
                "Volatility stop triggered"
            );
        }

        Ok((triggered, level))
    }

    /// Regression-slope signal over the last `n + m` bars ending at `as_of`
    pub async fn mean_reversion_signal(
        &self,
        instrument: &str,
        n: usize,
        m: usize,
        as_of: NaiveDate,
    ) -> Result<f64> {
        let bars = trailing_bars(self.market_data.as_ref(), instrument, as_of, n + m).await?;
        Ok(mean_reversion_signal(&bars, n, m))
    }

    /// Signal with the configured per-instrument window
    pub async fn position_signal(&self, instrument: &str, as_of: NaiveDate) -> Result<f64> {
        self.mean_reversion_signal(
            instrument,
            self.config.rsrs_window,
            self.config.rsrs_history,
            as_of,
        )
        .await
    }

    /// Percentage (0-100) of the reference universe closing above its own `period`-bar average
    ///
    /// Instruments whose data cannot be read or is too short are left out.
    pub async fn market_breadth(&self, period: usize, as_of: NaiveDate) -> f64 {
        let universe = match self.market_data.reference_universe().await {
            Ok(universe) => universe,
            Err(e) => {
                tracing::warn!(error = %e, "Reference universe unavailable, using neutral breadth");
                return NEUTRAL_BREADTH;
            }
        };

        let mut above = 0usize;
        let mut valid = 0usize;

        for instrument in universe.iter().take(self.config.breadth_sample_limit) {
            let bars = match trailing_bars(self.market_data.as_ref(), instrument, as_of, period).await {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::debug!(instrument = %instrument, error = %e, "Skipping instrument in breadth");
                    continue;
                }
            };

            let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
            let (Some(average), Some(&last)) = (calculate_sma(&closes, period), closes.last()) else {
                continue;
            };

            if last > average {
                above += 1;
            }
            valid += 1;
        }

        if valid == 0 {
            tracing::warn!("No instrument with enough history for breadth, using neutral breadth");
            return NEUTRAL_BREADTH;
        }

        let breadth = above as f64 / valid as f64 * 100.0;
        tracing::info!(valid, above, breadth = %format!("{:.2}", breadth), "Market breadth");
        breadth
    }

    /// Whether new positions may be opened
    ///
    /// Closed when the index proxy's signal falls below the timing threshold.
    pub async fn market_timing_open(&self, as_of: NaiveDate) -> bool {
        let signal = match self
            .mean_reversion_signal(
                &self.config.index_proxy,
                self.config.rsrs_window,
                self.config.market_rsrs_history,
                as_of,
            )
            .await
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Index history unavailable, timing gate left open");
                0.0
            }
        };

        let open = signal >= self.config.market_timing_threshold;
        if !open {
            tracing::info!(
                index = %self.config.index_proxy,
                signal = %format!("{:.3}", signal),
                threshold = self.config.market_timing_threshold,
                "⛔ Market timing gate closed"
            );
        }
        open
    }
}
