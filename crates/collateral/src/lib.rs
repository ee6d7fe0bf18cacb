pub mod breaker;
pub mod curve;
pub mod ledger;
pub mod manager;
pub mod pool;

pub use manager::CollateralManager;
pub use pool::{CapitalPool, PoolSnapshot, Tranche, TrancheSpec};
