//! Rolling 24h loss window for the circuit breaker.
//!
//! Losses are recorded when they are applied locally, before ledger
//! confirmation. A loss whose mutation is rolled back is removed again.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Default breaker window.
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct LossEntry {
    at: DateTime<Utc>,
    amount: Decimal,
    mutation_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct LossWindow {
    window: Duration,
    entries: VecDeque<LossEntry>,
}

impl LossWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, amount: Decimal, mutation_id: Uuid) {
        if amount <= Decimal::ZERO {
            return;
        }
        self.entries.push_back(LossEntry {
            at,
            amount,
            mutation_id,
        });
    }

    /// Drop the loss recorded for a rolled-back mutation.
    pub fn remove(&mut self, mutation_id: Uuid) -> Option<Decimal> {
        let index = self
            .entries
            .iter()
            .position(|e| e.mutation_id == mutation_id)?;
        self.entries.remove(index).map(|e| e.amount)
    }

    /// Total loss inside the window ending at `now`.
    pub fn total(&mut self, now: DateTime<Utc>) -> Decimal {
        let cutoff = now - self.window;
        while self.entries.front().is_some_and(|e| e.at < cutoff) {
            self.entries.pop_front();
        }
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Windowed loss as a fraction of the capital held before those losses.
    pub fn loss_ratio(&mut self, now: DateTime<Utc>, current_capital: Decimal) -> Decimal {
        let losses = self.total(now);
        let base = current_capital + losses;
        if base.is_zero() {
            Decimal::ZERO
        } else {
            losses / base
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_WINDOW_HOURS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_losses_expire_after_window() {
        let mut window = LossWindow::default();
        let t0 = Utc::now();
        window.record(t0, dec!(10), Uuid::new_v4());
        window.record(t0 + Duration::hours(12), dec!(5), Uuid::new_v4());

        assert_eq!(window.total(t0 + Duration::hours(13)), dec!(15));
        // First entry falls out of the window
        assert_eq!(window.total(t0 + Duration::hours(25)), dec!(5));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_remove_rolled_back_loss() {
        let mut window = LossWindow::default();
        let now = Utc::now();
        let id = Uuid::new_v4();
        window.record(now, dec!(7), id);
        window.record(now, dec!(3), Uuid::new_v4());

        assert_eq!(window.remove(id), Some(dec!(7)));
        assert_eq!(window.total(now), dec!(3));
        assert_eq!(window.remove(id), None);
    }

    #[test]
    fn test_loss_ratio_uses_pre_loss_capital() {
        let mut window = LossWindow::default();
        let now = Utc::now();
        window.record(now, dec!(25), Uuid::new_v4());
        // 75 left after a 25 loss → 25 / 100
        assert_eq!(window.loss_ratio(now, dec!(75)), dec!(0.25));
    }

    #[test]
    fn test_zero_amounts_ignored() {
        let mut window = LossWindow::default();
        window.record(Utc::now(), Decimal::ZERO, Uuid::new_v4());
        assert!(window.is_empty());
        assert_eq!(window.loss_ratio(Utc::now(), Decimal::ZERO), Decimal::ZERO);
    }
}
