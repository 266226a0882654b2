use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Bars in the ATR window
    pub atr_period: usize,
    /// Stop level = peak - atr_multiplier * ATR
    pub atr_multiplier: f64,
    /// Regression sub-window length (n)
    pub rsrs_window: usize,
    /// Number of slopes the z-score is taken against (m) for single instruments
    pub rsrs_history: usize,
    /// Same as `rsrs_history` for the market-wide timing gate
    pub market_rsrs_history: usize,
    /// Per-position exit when the signal falls below this
    pub exit_threshold: f64,
    /// New opens are blocked when the index signal falls below this
    pub market_timing_threshold: f64,
    /// Broad index used for the timing gate
    pub index_proxy: String,
    pub breadth_period: usize,
    /// Full liquidation when breadth (0-100) falls below this
    pub breadth_threshold: f64,
    pub breadth_sample_limit: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_multiplier: 2.0,
            rsrs_window: 18,
            rsrs_history: 600,
            market_rsrs_history: 200,
            exit_threshold: -0.7,
            market_timing_threshold: -0.9,
            index_proxy: "000300.SH".to_string(),
            breadth_period: 20,
            breadth_threshold: 45.0,
            breadth_sample_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    /// Maximum number of distinct holdings
    pub max_holdings: usize,
    /// Board lot in shares
    pub lot_size: u64,
    /// Day-over-day gain (percent) that counts as limit-up
    pub limit_up_pct: f64,
    /// Close within this distance of the high counts as "at the high"
    pub price_tolerance: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            max_holdings: 7,
            lot_size: 100,
            limit_up_pct: 9.5,
            price_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Days of month on which `rebalance` fires
    pub rebalance_days: Vec<u32>,
    pub risk_check_interval_secs: u64,
    pub limit_up_check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rebalance_days: vec![1, 15],
            risk_check_interval_secs: 300,
            limit_up_check_interval_secs: 600,
        }
    }
}

/// Paper venue and synthetic market used by the CLI
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_cash: f64,
    pub seed: u64,
    pub universe_size: usize,
    pub history_days: usize,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: 1_000_000.0,
            seed: 42,
            universe_size: 30,
            history_days: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `./config` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    ///
    /// `default.toml`, then `<QUANTBOT_ENV>.toml`, then `QUANTBOT__SECTION__KEY`
    /// environment variables. Missing files are fine.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_name = std::env::var("QUANTBOT_ENV").unwrap_or_else(|_| "development".to_string());

        Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env_name))).required(false))
            .add_source(
                Environment::with_prefix("QUANTBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
