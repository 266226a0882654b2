// Market data read interface used by the risk controller and the rebalancer
pub mod store;
pub mod synthetic;

pub use store::CandleStore;
pub use synthetic::{MarketScenario, SyntheticMarket};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use crate::models::Candle;
use crate::Result;

/// Daily bar provider
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Daily bars with `start <= date <= end`, oldest first
    async fn history(&self, instrument: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Candle>>;

    /// Instruments used for market breadth
    async fn reference_universe(&self) -> Result<Vec<String>>;
}

/// Upper bound on how far back `trailing_bars` searches
const MAX_LOOKBACK_DAYS: i64 = 20 * 366;

/// Fetch at most `count` trailing daily bars ending on or before `as_of`
///
/// The calendar range starts at roughly `count` weekdays and doubles until
/// `count` bars are found, a widening adds no earlier bar (the provider has
/// nothing older), or the range reaches `MAX_LOOKBACK_DAYS`. Holidays and
/// suspensions therefore never shorten the result while older data exists.
pub async fn trailing_bars(
    data: &dyn MarketData,
    instrument: &str,
    as_of: NaiveDate,
    count: usize,
) -> Result<Vec<Candle>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut span = ((count as i64) * 7 / 5 + 15).min(MAX_LOOKBACK_DAYS);
    let mut bars = data.history(instrument, as_of - Duration::days(span), as_of).await?;

    while bars.len() < count && span < MAX_LOOKBACK_DAYS {
        span = (span * 2).min(MAX_LOOKBACK_DAYS);
        let wider = data.history(instrument, as_of - Duration::days(span), as_of).await?;
        if wider.len() == bars.len() {
            break;
        }
        bars = wider;
    }

    if bars.len() > count {
        bars.drain(..bars.len() - count);
    }
    Ok(bars)
}

/// Latest bar on or before `as_of`
pub async fn latest_bar(data: &dyn MarketData, instrument: &str, as_of: NaiveDate) -> Result<Option<Candle>> {
    Ok(trailing_bars(data, instrument, as_of, 1).await?.pop())
}
