//! Boundary with the persisted ledger and the two-phase mutation model.
//!
//! Capital-affecting writes are applied locally as a `PendingMutation`
//! carrying the exact deltas it introduced, then submitted to the ledger.
//! The mutation ends `Confirmed` when the ledger accepts it or
//! `RolledBack` when the compensating reversal has been applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tranche_common::config::CollateralConfig;
use tranche_common::error::{PoolError, PoolResult};
use tranche_common::types::Policy;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Transient failure; worth retrying
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Permanent rejection; retrying will not help
    #[error("ledger rejected write: {0}")]
    Rejected(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Write primitives exposed by the persisted ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns the LP tokens minted.
    async fn deposit(&self, tranche_id: &str, amount: Decimal) -> Result<Decimal, LedgerError>;

    /// Returns the capital returned.
    async fn withdraw(
        &self,
        tranche_id: &str,
        token_amount: Decimal,
    ) -> Result<Decimal, LedgerError>;

    async fn record_payout(&self, policy_id: Uuid, amount: Decimal) -> Result<(), LedgerError>;
}

/// A ledger write awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Deposit { tranche_id: String, amount: Decimal },
    Withdraw { tranche_id: String, token_amount: Decimal },
    RecordPayout { policy_id: Uuid, amount: Decimal },
}

impl LedgerOp {
    pub async fn execute<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
    ) -> Result<LedgerReceipt, LedgerError> {
        match self {
            LedgerOp::Deposit { tranche_id, amount } => ledger
                .deposit(tranche_id, *amount)
                .await
                .map(LedgerReceipt::Minted),
            LedgerOp::Withdraw {
                tranche_id,
                token_amount,
            } => ledger
                .withdraw(tranche_id, *token_amount)
                .await
                .map(LedgerReceipt::Returned),
            LedgerOp::RecordPayout { policy_id, amount } => ledger
                .record_payout(*policy_id, *amount)
                .await
                .map(|_| LedgerReceipt::Recorded),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerOp::Deposit { .. } => "deposit",
            LedgerOp::Withdraw { .. } => "withdraw",
            LedgerOp::RecordPayout { .. } => "record_payout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedgerReceipt {
    Minted(Decimal),
    Returned(Decimal),
    Recorded,
}

/// Bounded exponential backoff for ledger submission.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CollateralConfig) -> Self {
        Self {
            max_attempts: config.ledger_max_retries.max(1),
            base_delay: Duration::from_millis(config.ledger_retry_base_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based; the first attempt has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Submit a write, retrying transient failures with exponential backoff.
pub async fn submit_with_retry<L: Ledger + ?Sized>(
    ledger: &L,
    op: &LedgerOp,
    policy: RetryPolicy,
) -> Result<LedgerReceipt, LedgerError> {
    let mut attempt = 1;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op.execute(ledger).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                tracing::warn!(
                    op = op.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Ledger write failed, retrying"
                );
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    op = op.name(),
                    attempt,
                    error = %e,
                    "Ledger write failed permanently"
                );
                return Err(e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Deposit,
    Withdraw,
    Payout,
}

/// Change applied to one tranche by a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheDelta {
    pub tranche_id: String,
    pub capital: Decimal,
    pub losses: Decimal,
    pub lp_tokens: Decimal,
}

/// A locally applied ledger write awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub kind: MutationKind,
    pub state: MutationState,
    pub op: LedgerOp,
    pub tranche_deltas: Vec<TrancheDelta>,
    pub reserves_delta: Decimal,
    pub coverage_delta: Decimal,
    /// Policy as it was before a payout, restored on rollback
    pub prior_policy: Option<Policy>,
    pub created_at: DateTime<Utc>,
}

impl PendingMutation {
    /// Advance the state machine. Only `Pending` may transition.
    pub fn transition(&mut self, next: MutationState) -> PoolResult<()> {
        match (self.state, next) {
            (MutationState::Pending, MutationState::Confirmed)
            | (MutationState::Pending, MutationState::RolledBack) => {
                self.state = next;
                Ok(())
            }
            (from, to) => Err(PoolError::InvalidTransition(format!(
                "mutation {} cannot go from {:?} to {:?}",
                self.id, from, to
            ))),
        }
    }
}

/// In-process ledger used by tests and standalone runs.
///
/// Supports fault injection: `fail_next(n)` makes the next `n` calls fail
/// transiently, `set_rejecting(true)` makes every call fail permanently.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    tranche_balances: Mutex<HashMap<String, Decimal>>,
    lp_supply: Mutex<HashMap<String, Decimal>>,
    payouts: Mutex<Vec<(Uuid, Decimal)>>,
    transient_failures: AtomicU32,
    rejecting: AtomicBool,
    calls: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payouts(&self) -> Vec<(Uuid, Decimal)> {
        self.payouts.lock().clone()
    }

    pub fn balance(&self, tranche_id: &str) -> Decimal {
        self.tranche_balances
            .lock()
            .get(tranche_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn gate(&self) -> Result<(), LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("ledger is rejecting writes".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn deposit(&self, tranche_id: &str, amount: Decimal) -> Result<Decimal, LedgerError> {
        self.gate()?;
        let mut balances = self.tranche_balances.lock();
        let mut supply = self.lp_supply.lock();
        let balance = balances.entry(tranche_id.to_string()).or_default();
        let tokens = supply.entry(tranche_id.to_string()).or_default();

        let minted = if balance.is_zero() || tokens.is_zero() {
            amount
        } else {
            amount * *tokens / *balance
        };
        *balance += amount;
        *tokens += minted;
        Ok(minted)
    }

    async fn withdraw(
        &self,
        tranche_id: &str,
        token_amount: Decimal,
    ) -> Result<Decimal, LedgerError> {
        self.gate()?;
        let mut balances = self.tranche_balances.lock();
        let mut supply = self.lp_supply.lock();
        let balance = balances.entry(tranche_id.to_string()).or_default();
        let tokens = supply.entry(tranche_id.to_string()).or_default();

        if token_amount > *tokens {
            return Err(LedgerError::Rejected(format!(
                "withdraw of {} tokens exceeds supply {}",
                token_amount, tokens
            )));
        }
        let returned = if tokens.is_zero() {
            Decimal::ZERO
        } else {
            token_amount * *balance / *tokens
        };
        *balance -= returned;
        *tokens -= token_amount;
        Ok(returned)
    }

    async fn record_payout(&self, policy_id: Uuid, amount: Decimal) -> Result<(), LedgerError> {
        self.gate()?;
        self.payouts.lock().push((policy_id, amount));
        Ok(())
    }
}
