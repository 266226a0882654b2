use thiserror::Error;

/// Error type shared by the library modules
#[derive(Error, Debug)]
pub enum BotError {
    // Venue / connectivity
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Account state unavailable: {0}")]
    AccountUnavailable(String),

    #[error("Invalid venue payload: {0}")]
    InvalidPayload(String),

    // Data
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Candidate selection failed: {0}")]
    Selection(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BotError>;
