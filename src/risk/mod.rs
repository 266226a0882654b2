// Risk management module
pub mod controller;

pub use controller::{RiskController, NEUTRAL_BREADTH};
