//! Per-subsystem cycle counters, exposed through `DaemonHandle::metrics`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use tranche_common::types::Subsystem;

/// How a subsystem cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Inputs unusable this cycle (stale price, nothing to do)
    Skipped(String),
    /// Pool moved between compute and apply
    Conflict(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubsystemMetrics {
    pub state: CycleState,
    pub cycles_run: u64,
    pub errors: u64,
    /// Cycles skipped for unusable inputs or because the previous run overran
    pub skipped: u64,
    pub conflicts: u64,
    pub last_duration_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DaemonMetrics {
    pub subsystems: BTreeMap<Subsystem, SubsystemMetrics>,
    pub ledger_confirmed: u64,
    pub ledger_rolled_back: u64,
    pub events_processed: u64,
    pub event_errors: u64,
}

impl DaemonMetrics {
    pub fn subsystem(&self, subsystem: Subsystem) -> SubsystemMetrics {
        self.subsystems.get(&subsystem).cloned().unwrap_or_default()
    }
}

/// Shared, cheaply cloneable metrics registry.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<DaemonMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a subsystem as mid-cycle.
    pub fn begin(&self, subsystem: Subsystem) {
        self.inner.lock().subsystems.entry(subsystem).or_default().state = CycleState::Running;
    }

    /// Record the end of one cycle. A run longer than `interval` also counts
    /// the ticks it swallowed as skipped.
    pub fn record_cycle<E: std::fmt::Display>(
        &self,
        subsystem: Subsystem,
        elapsed: Duration,
        interval: Duration,
        result: &Result<CycleOutcome, E>,
    ) {
        let mut metrics = self.inner.lock();
        let entry = metrics.subsystems.entry(subsystem).or_default();
        entry.state = CycleState::Idle;
        entry.cycles_run += 1;
        entry.last_duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        entry.last_run_at = Some(Utc::now());

        if !interval.is_zero() && elapsed > interval {
            let missed = elapsed.as_nanos() / interval.as_nanos();
            entry.skipped += u64::try_from(missed).unwrap_or(u64::MAX);
        }

        match result {
            Ok(CycleOutcome::Completed) => {}
            Ok(CycleOutcome::Skipped(_)) => entry.skipped += 1,
            Ok(CycleOutcome::Conflict(_)) => entry.conflicts += 1,
            Err(e) => {
                entry.errors += 1;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    pub fn record_settlement(&self, confirmed: bool) {
        let mut metrics = self.inner.lock();
        if confirmed {
            metrics.ledger_confirmed += 1;
        } else {
            metrics.ledger_rolled_back += 1;
        }
    }

    pub fn record_event(&self, ok: bool) {
        let mut metrics = self.inner.lock();
        metrics.events_processed += 1;
        if !ok {
            metrics.event_errors += 1;
        }
    }

    pub fn snapshot(&self) -> DaemonMetrics {
        self.inner.lock().clone()
    }
}
