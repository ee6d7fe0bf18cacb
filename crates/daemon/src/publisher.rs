//! Outbound daemon events.
//!
//! Every risk snapshot, recommendation, alert and halt transition is
//! broadcast to subscribers. Alerts go through a per-metric cooldown so a
//! persistent breach is reported once per window, not once per cycle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tranche_common::halt::HaltReason;
use tranche_common::types::{ArbitrageOpportunity, RebalanceAction, RiskAlert, RiskSnapshot};
use tranche_engine::cooldown::CooldownEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    RiskSnapshot {
        snapshot: RiskSnapshot,
    },
    Rebalance {
        action: RebalanceAction,
        applied: bool,
    },
    Arbitrage {
        opportunities: Vec<ArbitrageOpportunity>,
        applied: Option<ArbitrageOpportunity>,
    },
    Alert {
        alert: RiskAlert,
    },
    EmergencyShutdown {
        reasons: Vec<HaltReason>,
    },
    HaltCleared {
        reasons: Vec<HaltReason>,
    },
}

impl DaemonEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonEvent::RiskSnapshot { .. } => "risk_snapshot",
            DaemonEvent::Rebalance { .. } => "rebalance",
            DaemonEvent::Arbitrage { .. } => "arbitrage",
            DaemonEvent::Alert { .. } => "alert",
            DaemonEvent::EmergencyShutdown { .. } => "emergency_shutdown",
            DaemonEvent::HaltCleared { .. } => "halt_cleared",
        }
    }
}

pub struct Publisher {
    tx: broadcast::Sender<DaemonEvent>,
    cooldown: Mutex<CooldownEngine>,
}

impl Publisher {
    pub fn new(capacity: usize, alert_cooldown_secs: u64) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            cooldown: Mutex::new(CooldownEngine::new(alert_cooldown_secs)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: DaemonEvent) -> usize {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(event = name, "No subscribers for daemon event");
                0
            }
        }
    }

    /// Publish the snapshot, then every alert not in cooldown. Returns the
    /// number of alerts published.
    pub fn publish_risk(&self, snapshot: &RiskSnapshot, now: DateTime<Utc>) -> usize {
        self.publish(DaemonEvent::RiskSnapshot {
            snapshot: snapshot.clone(),
        });

        let mut published = 0;
        let mut cooldown = self.cooldown.lock();
        cooldown.prune(now);
        for alert in snapshot.breach_alerts.iter().chain(&snapshot.warning_alerts) {
            if !cooldown.check_and_set(&alert.metric, alert.severity, now) {
                continue;
            }
            tracing::warn!(
                metric = %alert.metric,
                severity = %alert.severity,
                value = %alert.value,
                threshold = %alert.threshold,
                "{}",
                alert.message
            );
            self.publish(DaemonEvent::Alert {
                alert: alert.clone(),
            });
            published += 1;
        }
        published
    }

    pub fn publish_halt(&self, reasons: Vec<HaltReason>) {
        self.publish(DaemonEvent::EmergencyShutdown { reasons });
    }
}
