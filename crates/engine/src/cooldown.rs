//! Cooldown engine: per-metric suppression of repeated alerts.
//!
//! After an alert is published for a metric, identical alerts are suppressed
//! for the cooldown window. An escalation (warning → critical) always passes.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use tranche_common::types::Severity;

/// Default cooldown duration in seconds (5 minutes).
const DEFAULT_COOLDOWN_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy)]
struct Fired {
    severity: Severity,
    at: DateTime<Utc>,
}

/// In-memory cooldown engine keyed by alert metric.
#[derive(Debug)]
pub struct CooldownEngine {
    window: Duration,
    fired: HashMap<String, Fired>,
}

impl CooldownEngine {
    pub fn new(cooldown_secs: u64) -> Self {
        let secs = i64::try_from(cooldown_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        Self {
            window: Duration::seconds(secs),
            fired: HashMap::new(),
        }
    }

    /// Check if a metric is in cooldown, and if not, start a new cooldown.
    ///
    /// Returns `true` if the alert should be published.
    pub fn check_and_set(&mut self, metric: &str, severity: Severity, now: DateTime<Utc>) -> bool {
        let allowed = match self.fired.get(metric) {
            None => true,
            Some(prev) => severity > prev.severity || now - prev.at >= self.window,
        };

        if allowed {
            self.fired
                .insert(metric.to_string(), Fired { severity, at: now });
        } else {
            tracing::debug!(
                metric,
                cooldown_secs = self.window.num_seconds(),
                "Alert suppressed: metric in cooldown"
            );
        }
        allowed
    }

    /// Clear the cooldown for a metric (e.g. once the condition resolves).
    pub fn clear(&mut self, metric: &str) {
        self.fired.remove(metric);
    }

    /// Drop every entry whose window has elapsed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.fired.retain(|_, f| now - f.at < window);
    }

    pub fn tracked_count(&self) -> usize {
        self.fired.len()
    }
}

impl Default for CooldownEngine {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_SECONDS as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_alert_passes_then_suppressed() {
        let mut engine = CooldownEngine::new(60);
        let now = Utc::now();
        assert!(engine.check_and_set("ltv", Severity::Warning, now));
        assert!(!engine.check_and_set("ltv", Severity::Warning, now + Duration::seconds(30)));
        assert!(engine.check_and_set("ltv", Severity::Warning, now + Duration::seconds(60)));
    }

    #[test]
    fn test_escalation_bypasses_cooldown() {
        let mut engine = CooldownEngine::default();
        let now = Utc::now();
        assert!(engine.check_and_set("ltv", Severity::Warning, now));
        assert!(engine.check_and_set("ltv", Severity::Critical, now));
        // De-escalation stays suppressed
        assert!(!engine.check_and_set("ltv", Severity::Warning, now));
    }

    #[test]
    fn test_metrics_are_independent() {
        let mut engine = CooldownEngine::default();
        let now = Utc::now();
        assert!(engine.check_and_set("ltv", Severity::Warning, now));
        assert!(engine.check_and_set("reserve_ratio", Severity::Warning, now));
        assert_eq!(engine.tracked_count(), 2);
    }

    #[test]
    fn test_clear_and_prune() {
        let mut engine = CooldownEngine::new(10);
        let now = Utc::now();
        engine.check_and_set("ltv", Severity::Warning, now);
        engine.check_and_set("var_99", Severity::Critical, now + Duration::seconds(8));

        engine.clear("ltv");
        assert!(engine.check_and_set("ltv", Severity::Warning, now));

        engine.prune(now + Duration::seconds(15));
        assert_eq!(engine.tracked_count(), 1);
    }
}
