/// Regression-slope mean-reversion signal (RSRS style)
///
/// For each of the trailing sub-windows of `n` bars, regress high on low
/// (volume weighted) and keep the slope and R². The signal is
///
///   z(slope_latest) * R²_latest * slope_latest
///
/// where the z-score is taken against the most recent `min(m, available)` slopes.
/// Strongly negative values mean support is weakening relative to resistance.

use super::regression::weighted_linear_regression;
use crate::models::Candle;

/// Compute the signal over the last `n + m` candles
///
/// Returns 0.0 for every degenerate case: fewer than `n + m` candles,
/// no usable sub-window, zero slope variance, or a non-finite result.
pub fn mean_reversion_signal(candles: &[Candle], n: usize, m: usize) -> f64 {
    if n < 2 || m == 0 || candles.len() < n + m {
        return 0.0;
    }

    let window = &candles[candles.len() - (n + m)..];
    let highs: Vec<f64> = window.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = window.iter().map(|c| c.low).collect();
    let volumes: Vec<f64> = window.iter().map(|c| c.volume).collect();

    let mut slopes = Vec::with_capacity(m + 1);
    let mut r_squared = Vec::with_capacity(m + 1);

    for start in 0..=(window.len() - n) {
        let end = start + n;
        let window_highs = &highs[start..end];
        let window_lows = &lows[start..end];

        if window_highs.iter().all(|h| *h == window_highs[0])
            || window_lows.iter().all(|l| *l == window_lows[0])
        {
            continue;
        }

        let volume_slice = &volumes[start..end];
        let volume_sum: f64 = volume_slice.iter().sum();
        let weights: Option<Vec<f64>> =
            if volume_sum > 0.0 && volume_slice.iter().all(|v| v.is_finite() && *v >= 0.0) {
                Some(volume_slice.iter().map(|v| v / volume_sum).collect())
            } else {
                None
            };

        if let Some(fit) = weighted_linear_regression(window_lows, window_highs, weights.as_deref()) {
            slopes.push(fit.slope);
            r_squared.push(fit.r_squared);
        }
    }

    let (Some(&current_slope), Some(&current_r2)) = (slopes.last(), r_squared.last()) else {
        return 0.0;
    };

    let valid_m = m.min(slopes.len());
    let recent = &slopes[slopes.len() - valid_m..];
    let mean = recent.iter().sum::<f64>() / valid_m as f64;
    let variance = recent.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / valid_m as f64;
    let sigma = variance.sqrt();

    if sigma < 1e-10 {
        return 0.0;
    }

    let z_score = (current_slope - mean) / sigma;
    let signal = z_score * current_r2 * current_slope;

    if signal.is_finite() {
        signal
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(i: usize, high: f64, low: f64) -> Candle {
        Candle {
            instrument: "TEST".to_string(),
            timestamp: Utc::now() + chrono::Duration::days(i as i64),
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1000.0 + (i % 3) as f64 * 100.0,
        }
    }

    /// `total` bars where high = 1 + low, except the last `tail` bars use `tail_high(low)`
    fn regime_change(total: usize, tail: usize, tail_high: impl Fn(f64) -> f64) -> Vec<Candle> {
        (0..total)
            .map(|i| {
                let low = 10.0 + (i % 5) as f64;
                let high = if i >= total - tail { tail_high(low) } else { low + 1.0 };
                candle(i, high, low)
            })
            .collect()
    }

    #[test]
    fn test_insufficient_data_is_neutral() {
        let candles = regime_change(20, 5, |low| 8.0 + 0.5 * low);
        assert_eq!(mean_reversion_signal(&candles, 18, 10), 0.0);
    }

    #[test]
    fn test_constant_windows_are_neutral() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 11.0, 10.0)).collect();
        assert_eq!(mean_reversion_signal(&candles, 18, 20), 0.0);
    }

    #[test]
    fn test_stable_slope_has_zero_variance() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let low = 10.0 + (i % 5) as f64;
                candle(i, low + 1.0, low)
            })
            .collect();
        assert_eq!(mean_reversion_signal(&candles, 10, 20), 0.0);
    }

    #[test]
    fn test_flattening_slope_is_negative() {
        let candles = regime_change(80, 10, |low| 8.0 + 0.5 * low);
        let signal = mean_reversion_signal(&candles, 10, 40);
        assert!(signal < -0.7, "signal was {}", signal);
    }

    #[test]
    fn test_steepening_slope_is_positive() {
        let candles = regime_change(80, 10, |low| 2.0 * low - 8.0);
        let signal = mean_reversion_signal(&candles, 10, 40);
        assert!(signal > 0.0, "signal was {}", signal);
    }
}
