// Technical indicators module
// ATR, SMA and the regression-based mean-reversion signal used by the risk controller

pub mod atr;
pub mod moving_average;
pub mod regression;
pub mod rsrs;

pub use atr::{calculate_atr, true_ranges};
pub use moving_average::calculate_sma;
pub use regression::{weighted_linear_regression, RegressionFit};
pub use rsrs::mean_reversion_signal;
