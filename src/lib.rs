// Core modules
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod market_data;
pub mod models;
pub mod portfolio;
pub mod risk;
pub mod scheduler;
pub mod selection;

// Re-export commonly used types
pub use error::{BotError, Result};
pub use models::*;
