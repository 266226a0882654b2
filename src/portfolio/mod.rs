// Capital allocation and the order-issuing rebalancer
pub mod allocation;
pub mod rebalancer;

pub use allocation::{allocate, score_weights, Allocation};
pub use rebalancer::{PortfolioRebalancer, RebalanceSummary, ReinvestSummary, RiskSummary};
