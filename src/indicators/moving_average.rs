/// Calculate Simple Moving Average (SMA) of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Some(104.0));
    }

    #[test]
    fn test_sma_uses_trailing_window() {
        let prices = vec![1.0, 1.0, 10.0, 20.0];
        assert_eq!(calculate_sma(&prices, 2), Some(15.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        assert!(calculate_sma(&prices, 5).is_none());
        assert!(calculate_sma(&prices, 0).is_none());
    }
}
