use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::CandleStore;
use crate::models::Candle;
use crate::Result;

/// Daily price cap/floor applied to every generated session
const DAILY_LIMIT: f64 = 0.10;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+0.3% daily average)
    Uptrend,
    /// Steady downtrend with noise (-0.3% daily average)
    Downtrend,
    /// Mean-reverting around the starting price
    Sideways,
    /// Large daily swings
    Volatile,
}

impl MarketScenario {
    const ALL: [MarketScenario; 4] = [
        MarketScenario::Uptrend,
        MarketScenario::Sideways,
        MarketScenario::Volatile,
        MarketScenario::Downtrend,
    ];
}

/// Generates seeded daily bars for a universe of instruments
pub struct SyntheticMarket {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    /// Probability that a session closes limit-up at its high
    limit_up_probability: f64,
}

impl SyntheticMarket {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 20.0,
            base_volume: 1_000_000.0,
            limit_up_probability: 0.02,
        }
    }

    pub fn with_limit_up_probability(mut self, probability: f64) -> Self {
        self.limit_up_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Weekday sessions starting at `start` (inclusive)
    pub fn sessions(start: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(count);
        let mut day = start;
        while days.len() < count {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                days.push(day);
            }
            day += Duration::days(1);
        }
        days
    }

    /// Generate `sessions` daily bars for one instrument
    pub fn generate(
        &mut self,
        instrument: &str,
        scenario: MarketScenario,
        start: NaiveDate,
        sessions: usize,
    ) -> Vec<Candle> {
        let (drift, noise) = match scenario {
            MarketScenario::Uptrend => (0.003, 0.015),
            MarketScenario::Downtrend => (-0.003, 0.015),
            MarketScenario::Sideways => (0.0, 0.01),
            MarketScenario::Volatile => (0.0, 0.04),
        };

        let base_price = self.base_price * self.rng.gen_range(0.5..2.5);
        let mut prev_close = base_price;
        let mut candles = Vec::with_capacity(sessions);

        for day in Self::sessions(start, sessions) {
            let limit_up = self.rng.gen_bool(self.limit_up_probability);

            let (open, high, low, close) = if limit_up {
                let close = round_price(prev_close * (1.0 + DAILY_LIMIT));
                let open = round_price(prev_close * self.rng.gen_range(1.0..1.05));
                let low = round_price(open.min(prev_close) * (1.0 - self.rng.gen_range(0.0..0.01)));
                (open, close, low, close)
            } else {
                let reversion = if scenario == MarketScenario::Sideways {
                    (base_price - prev_close) / base_price * 0.1
                } else {
                    0.0
                };
                let change = (drift + reversion + self.rng.gen_range(-noise..noise))
                    .clamp(-DAILY_LIMIT, DAILY_LIMIT * 0.9);
                let close = round_price(prev_close * (1.0 + change));
                let open = round_price(prev_close * (1.0 + self.rng.gen_range(-0.005..0.005)));
                let high = round_price(open.max(close) * (1.0 + self.rng.gen_range(0.0..0.01)));
                let low = round_price(open.min(close) * (1.0 - self.rng.gen_range(0.0..0.01)));
                (open, high, low, close)
            };

            let volume = self.base_volume * self.rng.gen_range(0.5..1.5);
            candles.push(create_candle(instrument, day, open, high, low, close, volume));
            prev_close = close;
        }

        candles
    }

    /// Fill `store` with bars for every instrument plus the index proxy
    ///
    /// Scenarios are assigned round-robin; the index always trends sideways.
    pub fn populate(
        &mut self,
        store: &CandleStore,
        instruments: &[String],
        index_proxy: &str,
        start: NaiveDate,
        sessions: usize,
    ) -> Result<()> {
        for (i, instrument) in instruments.iter().enumerate() {
            let scenario = MarketScenario::ALL[i % MarketScenario::ALL.len()];
            store.add_candles(self.generate(instrument, scenario, start, sessions))?;
        }

        let limit_up_probability = self.limit_up_probability;
        self.limit_up_probability = 0.0;
        let index_bars = self.generate(index_proxy, MarketScenario::Sideways, start, sessions);
        self.limit_up_probability = limit_up_probability;
        store.add_candles(index_bars)?;

        store.set_universe(instruments.to_vec())?;

        tracing::info!(
            instruments = instruments.len(),
            sessions,
            "Generated synthetic market"
        );
        Ok(())
    }
}

fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

fn create_candle(
    instrument: &str,
    day: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
) -> Candle {
    Candle {
        instrument: instrument.to_string(),
        timestamp: Utc.from_utc_datetime(&day.and_hms_opt(7, 0, 0).unwrap_or_default()),
        open,
        high,
        low,
        close,
        volume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    #[test]
    fn test_sessions_skip_weekends() {
        let days = SyntheticMarket::sessions(start(), 10);
        assert_eq!(days.len(), 10);
        assert!(days
            .iter()
            .all(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun)));
    }

    #[test]
    fn test_same_seed_same_bars() {
        let a = SyntheticMarket::new(7).generate("A", MarketScenario::Volatile, start(), 50);
        let b = SyntheticMarket::new(7).generate("A", MarketScenario::Volatile, start(), 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bars_are_well_formed() {
        let mut market = SyntheticMarket::new(1);
        for scenario in MarketScenario::ALL {
            let candles = market.generate("A", scenario, start(), 200);
            assert_eq!(candles.len(), 200);
            for pair in candles.windows(2) {
                let (prev, bar) = (&pair[0], &pair[1]);
                assert!(bar.high >= bar.close && bar.high >= bar.open);
                assert!(bar.low <= bar.close && bar.low <= bar.open);
                assert!(bar.close <= prev.close * 1.1 + 0.01);
                assert!(bar.date() > prev.date());
            }
        }
    }

    #[test]
    fn test_limit_up_sessions_close_at_high() {
        let candles = SyntheticMarket::new(3)
            .with_limit_up_probability(1.0)
            .generate("A", MarketScenario::Sideways, start(), 5);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].close, pair[1].high);
            assert!(pair[1].close / pair[0].close > 1.095);
        }
    }

    #[test]
    fn test_populate_sets_universe() {
        let store = CandleStore::new();
        let instruments = vec!["A".to_string(), "B".to_string()];
        SyntheticMarket::new(9)
            .populate(&store, &instruments, "INDEX", start(), 30)
            .unwrap();

        assert_eq!(store.candle_count("A").unwrap(), 30);
        assert_eq!(store.candle_count("INDEX").unwrap(), 30);
    }
}
