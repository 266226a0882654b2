/// Average True Range (ATR) indicator
///
/// Measures volatility as the mean true range over a trailing window.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Plain arithmetic mean, no Wilder smoothing: the trailing stop wants the
/// window's volatility, not a long-memory average.

use crate::models::Candle;

/// True range of every bar that has a predecessor (len = candles.len() - 1)
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let high = pair[1].high;
            let low = pair[1].low;

            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Calculate ATR over the last `period` bars
///
/// Returns None if there are fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(&candles[candles.len() - period - 1..]);
    let atr = ranges.iter().sum::<f64>() / period as f64;

    if atr.is_finite() {
        Some(atr)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                instrument: "TEST".to_string(),
                timestamp: Utc::now() + chrono::Duration::days(i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_calculate_atr_flat_market() {
        let prices = vec![(100.0, 101.0, 99.0, 100.0); 15];

        let candles = create_test_candles(&prices);
        let atr = calculate_atr(&candles, 14);

        // Every true range is high - low = 2.0
        assert!((atr.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_true_range_uses_gap_from_previous_close() {
        let candles = create_test_candles(&[
            (100.0, 101.0, 99.0, 100.0),
            // Gap up: high - prev_close = 10 beats high - low = 2
            (109.0, 110.0, 108.0, 109.0),
            // Gap down: prev_close - low = 10 beats high - low = 1
            (100.0, 100.0, 99.0, 99.5),
        ]);

        let ranges = true_ranges(&candles);
        assert_eq!(ranges, vec![10.0, 10.0]);
    }

    #[test]
    fn test_atr_only_looks_at_trailing_window() {
        let mut prices = vec![(100.0, 120.0, 80.0, 100.0); 10];
        prices.extend(vec![(100.0, 100.5, 99.5, 100.0); 4]);

        let candles = create_test_candles(&prices);
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!((atr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_data() {
        let prices = vec![(100.0, 101.0, 99.0, 100.0), (100.0, 101.0, 99.0, 100.0)];

        let candles = create_test_candles(&prices);
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(calculate_atr(&candles, 0).is_none());
    }
}
