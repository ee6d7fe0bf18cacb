//! Hysteresis engine: prevents acting on a recommendation that flickers between cycles.
//!
//! A rebalance recommendation must be repeated for N consecutive cycles of the
//! same subsystem before it is acted on. A `Hold`, a change of direction or a
//! skipped cycle restarts the streak.
//!
//! State is held in-memory per subsystem. If the daemon restarts, every streak
//! starts over.

use std::collections::HashMap;

use tranche_common::types::{RebalanceKind, Subsystem};

/// Default number of consecutive cycles required before acting.
const DEFAULT_CONFIRM_CYCLES: u64 = 1;

/// Per-subsystem streak tracking state.
#[derive(Debug, Clone)]
struct HysteresisState {
    /// Direction being confirmed
    kind: RebalanceKind,
    /// Number of consecutive cycles recommending `kind`
    consecutive_count: u64,
    /// Cycle number when the streak started
    first_cycle: u64,
    /// Most recent cycle number in the streak
    last_cycle: u64,
}

/// In-memory hysteresis engine.
pub struct HysteresisEngine {
    states: HashMap<Subsystem, HysteresisState>,
    required: u64,
}

impl HysteresisEngine {
    pub fn new(required_cycles: u64) -> Self {
        Self {
            states: HashMap::new(),
            required: required_cycles.max(DEFAULT_CONFIRM_CYCLES),
        }
    }

    /// Record this cycle's recommendation for `subsystem`.
    ///
    /// Returns `true` only when `kind` has been recommended for the required
    /// number of consecutive cycles. The streak is then cleared so the next
    /// action needs a fresh one.
    pub fn check(&mut self, subsystem: Subsystem, kind: RebalanceKind, cycle: u64) -> bool {
        if kind == RebalanceKind::Hold {
            self.states.remove(&subsystem);
            return false;
        }

        let state = self.states.entry(subsystem).or_insert(HysteresisState {
            kind,
            consecutive_count: 0,
            first_cycle: cycle,
            last_cycle: cycle,
        });

        let continues = state.kind == kind
            && (state.consecutive_count == 0
                || cycle == state.last_cycle + 1
                || cycle == state.last_cycle);

        if continues {
            // Same cycle counted once
            if state.consecutive_count == 0 || cycle != state.last_cycle {
                state.consecutive_count += 1;
            }
            state.last_cycle = cycle;
        } else {
            // Direction change or gap → restart streak
            state.kind = kind;
            state.consecutive_count = 1;
            state.first_cycle = cycle;
            state.last_cycle = cycle;
        }

        if state.consecutive_count >= self.required {
            tracing::debug!(
                subsystem = %subsystem,
                kind = %kind,
                first_cycle = state.first_cycle,
                cycle,
                "Recommendation confirmed"
            );
            self.states.remove(&subsystem);
            true
        } else {
            false
        }
    }

    /// Current streak length for a subsystem.
    pub fn streak(&self, subsystem: Subsystem) -> u64 {
        self.states
            .get(&subsystem)
            .map(|s| s.consecutive_count)
            .unwrap_or(0)
    }

    pub fn reset(&mut self, subsystem: Subsystem) {
        self.states.remove(&subsystem);
    }

    /// Number of subsystems with an open streak (for monitoring).
    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for HysteresisEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_CYCLES)
    }
}
