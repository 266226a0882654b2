use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::MarketData;
use crate::models::Candle;
use crate::{BotError, Result};

/// Thread-safe in-memory store of daily bars
///
/// Bars are kept sorted by session date, one bar per instrument per date.
#[derive(Clone, Default)]
pub struct CandleStore {
    data: Arc<RwLock<HashMap<String, Vec<Candle>>>>,
    universe: Arc<RwLock<Vec<String>>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> BotError {
    BotError::MarketDataUnavailable(format!("candle store lock poisoned: {}", e))
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bar, replacing any existing bar for the same instrument and date
    pub fn add_candle(&self, candle: Candle) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        let bars = data.entry(candle.instrument.clone()).or_default();

        match bars.binary_search_by_key(&candle.date(), |c| c.date()) {
            Ok(idx) => bars[idx] = candle,
            Err(idx) => bars.insert(idx, candle),
        }

        Ok(())
    }

    pub fn add_candles(&self, candles: impl IntoIterator<Item = Candle>) -> Result<()> {
        for candle in candles {
            self.add_candle(candle)?;
        }
        Ok(())
    }

    /// Replace the breadth reference universe
    pub fn set_universe(&self, instruments: Vec<String>) -> Result<()> {
        *self.universe.write().map_err(poisoned)? = instruments;
        Ok(())
    }

    /// All bars for an instrument, oldest first
    pub fn get_candles(&self, instrument: &str) -> Result<Vec<Candle>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(instrument).cloned().unwrap_or_default())
    }

    pub fn candle_count(&self, instrument: &str) -> Result<usize> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(instrument).map(|d| d.len()).unwrap_or(0))
    }

    /// All instruments with at least one bar
    pub fn instruments(&self) -> Result<Vec<String>> {
        let data = self.data.read().map_err(poisoned)?;
        let mut instruments: Vec<String> = data.keys().cloned().collect();
        instruments.sort();
        Ok(instruments)
    }

    /// Close of the latest bar on or before `as_of`
    pub fn close_on(&self, instrument: &str, as_of: NaiveDate) -> Result<Option<f64>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(instrument).and_then(|bars| {
            bars.iter()
                .rev()
                .find(|c| c.date() <= as_of)
                .map(|c| c.close)
        }))
    }
}

#[async_trait]
impl MarketData for CandleStore {
    async fn history(&self, instrument: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Candle>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .get(instrument)
            .map(|bars| {
                bars.iter()
                    .filter(|c| c.date() >= start && c.date() <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reference_universe(&self) -> Result<Vec<String>> {
        let universe = self.universe.read().map_err(poisoned)?;
        if universe.is_empty() {
            drop(universe);
            return self.instruments();
        }
        Ok(universe.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{latest_bar, trailing_bars};
    use chrono::{Datelike, TimeZone, Utc};

    fn create_test_candle(instrument: &str, day: u32, price: f64) -> Candle {
        Candle {
            instrument: instrument.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, day, 7, 0, 0).unwrap(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn test_bars_stay_sorted() {
        let store = CandleStore::new();
        store.add_candle(create_test_candle("A", 5, 105.0)).unwrap();
        store.add_candle(create_test_candle("A", 2, 102.0)).unwrap();
        store.add_candle(create_test_candle("A", 3, 103.0)).unwrap();

        let closes: Vec<f64> = store.get_candles("A").unwrap().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 105.0]);
    }

    #[test]
    fn test_same_date_replaces() {
        let store = CandleStore::new();
        store.add_candle(create_test_candle("A", 2, 100.0)).unwrap();
        store.add_candle(create_test_candle("A", 2, 101.0)).unwrap();

        assert_eq!(store.candle_count("A").unwrap(), 1);
        assert_eq!(store.close_on("A", date(2)).unwrap(), Some(101.0));
    }

    #[test]
    fn test_close_on_uses_latest_bar_before_date() {
        let store = CandleStore::new();
        store.add_candle(create_test_candle("A", 2, 100.0)).unwrap();
        store.add_candle(create_test_candle("A", 6, 110.0)).unwrap();

        assert_eq!(store.close_on("A", date(4)).unwrap(), Some(100.0));
        assert_eq!(store.close_on("A", date(1)).unwrap(), None);
        assert_eq!(store.close_on("B", date(4)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_history_range() {
        let store = CandleStore::new();
        for day in 1..=10 {
            store.add_candle(create_test_candle("A", day, day as f64)).unwrap();
        }

        let bars = store.history("A", date(3), date(5)).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 3.0);

        let trailing = trailing_bars(&store, "A", date(8), 4).await.unwrap();
        let closes: Vec<f64> = trailing.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![5.0, 6.0, 7.0, 8.0]);

        let latest = latest_bar(&store, "A", date(20)).await.unwrap().unwrap();
        assert_eq!(latest.close, 10.0);
    }

    #[tokio::test]
    async fn test_trailing_bars_span_exchange_closures() {
        // Four years of weekday sessions with two week-long closures per year
        let store = CandleStore::new();
        let mut day = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        let mut stored = 0usize;
        while day <= end {
            let closed = (day.month() == 2 && day.day() <= 7) || (day.month() == 10 && day.day() <= 7);
            if day.weekday().num_days_from_monday() < 5 && !closed {
                store
                    .add_candle(Candle {
                        instrument: "A".to_string(),
                        timestamp: Utc.from_utc_datetime(&day.and_hms_opt(7, 0, 0).unwrap()),
                        open: 10.0,
                        high: 10.0,
                        low: 10.0,
                        close: 10.0,
                        volume: 1000.0,
                    })
                    .unwrap();
                stored += 1;
            }
            day += chrono::Duration::days(1);
        }
        assert!(stored > 618);

        let bars = trailing_bars(&store, "A", end, 618).await.unwrap();
        assert_eq!(bars.len(), 618);
        assert_eq!(bars.last().unwrap().date(), end);

        // Asking for more than exists returns everything, oldest first
        let all = trailing_bars(&store, "A", end, 5000).await.unwrap();
        assert_eq!(all.len(), stored);
        assert_eq!(all[0].date(), NaiveDate::from_ymd_opt(2022, 1, 3).unwrap());

        assert!(trailing_bars(&store, "A", end, 0).await.unwrap().is_empty());
        assert!(trailing_bars(&store, "MISSING", end, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_universe_defaults_to_known_instruments() {
        let store = CandleStore::new();
        store.add_candle(create_test_candle("B", 2, 1.0)).unwrap();
        store.add_candle(create_test_candle("A", 2, 1.0)).unwrap();

        assert_eq!(store.reference_universe().await.unwrap(), vec!["A", "B"]);

        store.set_universe(vec!["C".to_string()]).unwrap();
        assert_eq!(store.reference_universe().await.unwrap(), vec!["C"]);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let store = CandleStore::new();
        let store_clone = store.clone();

        let handle = thread::spawn(move || {
            for day in 1..=14 {
                store_clone.add_candle(create_test_candle("A", day, day as f64)).unwrap();
            }
        });

        for day in 15..=28 {
            store.add_candle(create_test_candle("A", day, day as f64)).unwrap();
        }

        handle.join().unwrap();
        assert_eq!(store.candle_count("A").unwrap(), 28);
    }
}
