pub mod arbitrage;
pub mod cooldown;
pub mod exposure;
pub mod hysteresis;
pub mod rebalancer;
pub mod risk_monitor;

pub use arbitrage::find_arbitrage_opportunities;
pub use rebalancer::evaluate_rebalancing;
pub use risk_monitor::calculate_risk_metrics;
