//! Process-wide emergency halt flag.
//!
//! Once raised, no new coverage is allocated until an operator clears it.
//! Payouts keep flowing while halted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Why the pool was halted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// A loss exceeded total capital.
    Insolvent { loss: String, available: String },
    /// Health check saw LTV above the shutdown limit.
    LtvLimit { ltv: String, limit: String },
    /// Rolling 24h losses tripped the circuit breaker.
    CircuitBreaker { loss_pct: String, limit_pct: String },
    /// A ledger rollback took back cash the pool had already spent.
    ReserveShortfall { shortfall: String },
    /// Operator-triggered halt.
    Manual { reason: String },
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Insolvent { loss, available } => {
                write!(f, "insolvent: loss {} > capital {}", loss, available)
            }
            HaltReason::LtvLimit { ltv, limit } => {
                write!(f, "ltv {} above shutdown limit {}", ltv, limit)
            }
            HaltReason::CircuitBreaker {
                loss_pct,
                limit_pct,
            } => write!(
                f,
                "circuit breaker: 24h losses {}% > {}%",
                loss_pct, limit_pct
            ),
            HaltReason::ReserveShortfall { shortfall } => {
                write!(f, "rollback left reserves {} short", shortfall)
            }
            HaltReason::Manual { reason } => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Default)]
struct HaltInner {
    halted: AtomicBool,
    reasons: Mutex<Vec<HaltReason>>,
}

/// Cheaply cloneable handle to the shared halt state.
#[derive(Debug, Clone, Default)]
pub struct HaltFlag {
    inner: Arc<HaltInner>,
}

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    /// Raise the flag. Returns `true` if this call transitioned it from clear to halted.
    pub fn trigger(&self, reason: HaltReason) -> bool {
        let newly = !self.inner.halted.swap(true, Ordering::AcqRel);
        let mut reasons = self.inner.reasons.lock();
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
        newly
    }

    pub fn reasons(&self) -> Vec<HaltReason> {
        self.inner.reasons.lock().clone()
    }

    /// Manual operator reset.
    pub fn clear(&self) {
        self.inner.halted.store(false, Ordering::Release);
        self.inner.reasons.lock().clear();
    }
}
