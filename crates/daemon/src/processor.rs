//! Policy event processor: applies lifecycle events from the policy layer.
//!
//! Pipeline per event:
//! 1. Dispatch on the event type
//! 2. Apply through the daemon state (allocation, expiry, or payout + ledger settlement)
//! 3. Count the result and log it

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use tranche_common::error::PoolResult;
use tranche_common::types::PolicyEvent;

use crate::orchestrator::DaemonState;

pub struct EventProcessor {
    state: Arc<DaemonState>,
}

impl EventProcessor {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    pub async fn process_event(&self, event: PolicyEvent) -> PoolResult<()> {
        let kind = event_kind(&event);
        let result = match event {
            PolicyEvent::PolicyCreated { policy } => {
                let policy_id = policy.policy_id;
                self.state.submit_policy(policy).await.map(|receipt| {
                    tracing::info!(
                        policy_id = %policy_id,
                        ltv_after = %receipt.ltv_after.round_dp(4),
                        premium = ?receipt.premium.as_ref().map(|p| p.amount),
                        "Coverage allocated"
                    );
                })
            }
            PolicyEvent::PolicyExpired { policy_id } => {
                self.state.expire_policy(policy_id).await.map(|()| {
                    tracing::info!(policy_id = %policy_id, "Policy expired");
                })
            }
            PolicyEvent::ClaimApproved { policy_id, amount } => self
                .state
                .approve_claim(policy_id, amount)
                .await
                .map(|receipt| {
                    tracing::info!(
                        policy_id = %policy_id,
                        amount = %amount,
                        tranches_hit = receipt.allocation.shares.len(),
                        "Claim paid"
                    );
                }),
        };

        self.state.metrics_registry().record_event(result.is_ok());
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(event = kind, error = %e, "Policy event failed");
            } else {
                tracing::warn!(event = kind, error = %e, "Policy event rejected");
            }
        }
        result
    }

    /// Consume events until the channel closes or shutdown is signalled.
    ///
    /// Shutdown is observed between events only, never mid-mutation.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<PolicyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Policy event consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                maybe = events.recv() => {
                    let Some(event) = maybe else {
                        break;
                    };
                    // Outcome already counted and logged
                    let _ = self.process_event(event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Policy event consumer stopped");
    }
}

fn event_kind(event: &PolicyEvent) -> &'static str {
    match event {
        PolicyEvent::PolicyCreated { .. } => "policy_created",
        PolicyEvent::PolicyExpired { .. } => "policy_expired",
        PolicyEvent::ClaimApproved { .. } => "claim_approved",
    }
}
