use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::types::Subsystem;

/// Error taxonomy shared by the collateral manager, the risk engine and the daemon.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("Capacity exceeded: post-allocation LTV {requested_ltv} > ceiling {max_ltv}")]
    CapacityExceeded {
        requested_ltv: Decimal,
        max_ltv: Decimal,
    },

    #[error("Insolvent: loss {loss} exceeds available capital {available}")]
    Insolvent { loss: Decimal, available: Decimal },

    #[error("Stale price data for {asset}: {age_secs}s old")]
    StaleData { asset: String, age_secs: i64 },

    #[error("{subsystem} cycle failed: {message}")]
    SubsystemCycle {
        subsystem: Subsystem,
        message: String,
    },

    #[error("Apply conflict: {0}")]
    ApplyConflict(String),

    #[error("Emergency shutdown active: {0}")]
    EmergencyShutdown(String),

    #[error("Policy not found: {0}")]
    PolicyNotFound(Uuid),

    #[error("Policy {0} is not active")]
    PolicyNotActive(Uuid),

    #[error("Tranche not found: {0}")]
    TrancheNotFound(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether the error marks a pool-level fatal condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::Insolvent { .. } | PoolError::InvariantViolation(_)
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
