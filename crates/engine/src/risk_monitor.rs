//! Risk monitor: VaR, LTV, reserve ratio, stress tests and threshold alerts.
//!
//! `calculate_risk_metrics` is a pure function of its inputs: the snapshot
//! time is used as "now", nothing is cached between calls, and iteration
//! order is fixed (`BTreeMap`s and input order), so identical inputs always
//! produce an identical `RiskSnapshot`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use tranche_collateral::PoolSnapshot;
use tranche_collateral::pool::ratio;
use tranche_common::config::RiskConfig;
use tranche_common::error::{PoolError, PoolResult};
use tranche_common::types::{
    MarketData, PricePoint, PriceScenario, RiskAlert, RiskSnapshot, Severity, StressTestResult,
};

use crate::exposure;

const VAR_95: Decimal = Decimal::from_parts(95, 0, 0, false, 2);
const VAR_99: Decimal = Decimal::from_parts(99, 0, 0, false, 2);

pub fn calculate_risk_metrics(
    snapshot: &PoolSnapshot,
    price_scenarios: &[PriceScenario],
    market: &MarketData,
    config: &RiskConfig,
) -> RiskSnapshot {
    let pool = &snapshot.pool;
    let capital = pool.total_capital_usd;
    let ltv = pool.ltv_or_max();
    let reserve_ratio = pool.reserve_ratio();

    let mut alerts = AlertSink::new(config.warning_fraction);

    // ---- Historical-simulation VaR ----
    let losses = historical_losses(snapshot, market);
    let (var_95, var_99) = if losses.len() < 2 {
        alerts.warn(RiskAlert {
            severity: Severity::Warning,
            metric: "var_history".to_string(),
            message: format!(
                "only {} historical observation(s); VaR reported as zero",
                losses.len()
            ),
            value: Decimal::from(losses.len()),
            threshold: Decimal::TWO,
        });
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        let var_95 = quantile(&losses, VAR_95).max(Decimal::ZERO);
        let var_99 = quantile(&losses, VAR_99).max(var_95);
        (var_95, var_99)
    };

    // ---- Stress scenarios ----
    let stress_test_results = stress_tests(snapshot, price_scenarios, market, config);

    // ---- Threshold alerts ----
    alerts.above("ltv", "loan-to-value", ltv, config.max_ltv, false);
    alerts.below("reserve_ratio", "reserve ratio", reserve_ratio, config.min_reserve_ratio);
    if var_99 > Decimal::ZERO {
        alerts.above("var_99", "99% value-at-risk", var_99, capital, false);
    }
    for result in &stress_test_results {
        alerts.above(
            &format!("stress:{}:{}", result.scenario, result.price_scenario),
            "stress loss ratio",
            result.loss_ratio,
            config.stress_breach_ratio,
            true,
        );
    }
    concentration_alerts(&mut alerts, snapshot, config);

    // ---- Staleness ----
    let mut stale_data = false;
    for asset in relevant_assets(snapshot, market) {
        if let Err(PoolError::StaleData { asset, age_secs }) = ensure_fresh(
            market,
            &asset,
            snapshot.taken_at,
            config.max_price_age_secs,
        ) {
            stale_data = true;
            let message = if has_history(market, &asset) {
                format!("{} price data is {}s old", asset, age_secs)
            } else {
                format!("{} is priced without any history", asset)
            };
            alerts.warn(RiskAlert {
                severity: Severity::Warning,
                metric: format!("stale:{}", asset),
                message,
                value: Decimal::from(age_secs),
                threshold: Decimal::from(config.max_price_age_secs),
            });
        }
    }

    RiskSnapshot {
        var_95,
        var_99,
        ltv,
        reserve_ratio,
        stress_test_results,
        breach_alerts: alerts.breaches,
        warning_alerts: alerts.warnings,
        stale_data,
        pool_version: snapshot.version,
        computed_at: snapshot.taken_at,
    }
}

/// Fail with `StaleData` if the feed or the newest history point for `asset`
/// is older than `max_age_secs`.
///
/// An asset with a price but no history has no observation time of its own and
/// is always stale; its age is taken from the feed timestamp, or `i64::MAX`
/// when the feed carries none. An asset the feed does not price at all is ignored.
pub fn ensure_fresh(
    market: &MarketData,
    asset: &str,
    now: DateTime<Utc>,
    max_age_secs: i64,
) -> PoolResult<()> {
    let feed_age = market.updated_at.map(|at| (now - at).num_seconds());
    let stale = |age_secs: i64| PoolError::StaleData {
        asset: asset.to_string(),
        age_secs,
    };

    let Some(latest) = market.history.get(asset).and_then(|h| h.last()) else {
        if market.prices.contains_key(asset) {
            return Err(stale(feed_age.unwrap_or(i64::MAX)));
        }
        return Ok(());
    };
    let age_secs = (now - latest.timestamp)
        .num_seconds()
        .max(feed_age.unwrap_or(i64::MIN));
    if age_secs > max_age_secs {
        return Err(stale(age_secs));
    }
    Ok(())
}

fn has_history(market: &MarketData, asset: &str) -> bool {
    market.history.get(asset).is_some_and(|h| !h.is_empty())
}

/// `ceil(q·n)`-th smallest loss (1-based), `losses` sorted ascending.
fn quantile(losses: &[Decimal], q: Decimal) -> Decimal {
    let n = losses.len();
    if n == 0 {
        return Decimal::ZERO;
    }
    let rank = (q * Decimal::from(n))
        .ceil()
        .to_usize()
        .unwrap_or(n)
        .clamp(1, n);
    losses[rank - 1]
}

/// Insured assets of active policies, plus the float asset when float is held.
fn relevant_assets(snapshot: &PoolSnapshot, market: &MarketData) -> BTreeSet<String> {
    let mut assets: BTreeSet<String> = snapshot
        .active_policies
        .iter()
        .map(|p| p.insured_asset.clone())
        .collect();
    if snapshot.pool.float_asset_units > Decimal::ZERO && !market.float_asset.is_empty() {
        assets.insert(market.float_asset.clone());
    }
    assets
}

/// Per-period returns for one asset, oldest first.
fn returns(history: &[PricePoint]) -> Vec<Decimal> {
    history
        .windows(2)
        .filter(|w| w[0].price > Decimal::ZERO)
        .map(|w| w[1].price / w[0].price - Decimal::ONE)
        .collect()
}

/// Pool loss for each aligned historical period, sorted ascending.
///
/// Series are aligned on their most recent observations; the usable window is
/// the shortest return series among the relevant assets that have history.
fn historical_losses(snapshot: &PoolSnapshot, market: &MarketData) -> Vec<Decimal> {
    let series: BTreeMap<String, Vec<Decimal>> = relevant_assets(snapshot, market)
        .into_iter()
        .filter_map(|asset| {
            let history = market.history.get(&asset)?;
            let r = returns(history);
            (!r.is_empty()).then_some((asset, r))
        })
        .collect();

    let Some(periods) = series.values().map(Vec::len).min() else {
        return Vec::new();
    };

    let mut losses: Vec<Decimal> = (0..periods)
        .map(|i| {
            let shocks: BTreeMap<String, Decimal> = series
                .iter()
                .map(|(asset, r)| (asset.clone(), r[r.len() - periods + i]))
                .collect();
            let moved = exposure::apply_returns(&market.prices, &shocks);
            exposure::pool_loss(snapshot, &market.prices, &moved, &market.float_asset)
        })
        .collect();
    losses.sort();
    losses
}

fn stress_tests(
    snapshot: &PoolSnapshot,
    price_scenarios: &[PriceScenario],
    market: &MarketData,
    config: &RiskConfig,
) -> Vec<StressTestResult> {
    let capital = snapshot.pool.total_capital_usd;
    let mut results = Vec::with_capacity(config.stress_scenarios.len() * price_scenarios.len());

    for stress in &config.stress_scenarios {
        let Ok(severity) = Decimal::try_from(stress.severity) else {
            tracing::warn!(scenario = %stress.name, severity = stress.severity, "Skipping stress scenario with invalid severity");
            continue;
        };
        for scenario in price_scenarios {
            let moved = exposure::shocked_prices(&market.prices, scenario, severity);
            let loss = exposure::pool_loss(snapshot, &market.prices, &moved, &market.float_asset);
            let loss_ratio = ratio(loss, capital).unwrap_or(Decimal::MAX);
            results.push(StressTestResult {
                scenario: stress.name.clone(),
                price_scenario: scenario.name.clone(),
                severity: stress.severity,
                simulated_loss: loss,
                loss_ratio,
                insolvent: loss > capital,
            });
        }
    }
    results
}

/// Collects breach and warning alerts for one computation.
struct AlertSink {
    breaches: Vec<RiskAlert>,
    warnings: Vec<RiskAlert>,
    warning_fraction: Decimal,
}

impl AlertSink {
    fn new(warning_fraction: Decimal) -> Self {
        Self {
            breaches: Vec::new(),
            warnings: Vec::new(),
            warning_fraction,
        }
    }

    fn warn(&mut self, alert: RiskAlert) {
        self.warnings.push(alert);
    }

    /// Breach above `limit` (or at it when `inclusive`), warning above `limit × warning_fraction`.
    fn above(&mut self, metric: &str, label: &str, value: Decimal, limit: Decimal, inclusive: bool) {
        let breached = if inclusive { value >= limit } else { value > limit };
        if breached {
            self.breaches.push(RiskAlert {
                severity: Severity::Critical,
                metric: metric.to_string(),
                message: format!("{} {} exceeds limit {}", label, value.round_dp(4), limit),
                value,
                threshold: limit,
            });
        } else if value > limit * self.warning_fraction {
            self.warnings.push(RiskAlert {
                severity: Severity::Warning,
                metric: metric.to_string(),
                message: format!("{} {} approaching limit {}", label, value.round_dp(4), limit),
                value,
                threshold: limit,
            });
        }
    }

    /// Breach below `floor`, warning below `floor / warning_fraction`.
    fn below(&mut self, metric: &str, label: &str, value: Decimal, floor: Decimal) {
        if value < floor {
            self.breaches.push(RiskAlert {
                severity: Severity::Critical,
                metric: metric.to_string(),
                message: format!("{} {} below minimum {}", label, value.round_dp(4), floor),
                value,
                threshold: floor,
            });
        } else if !self.warning_fraction.is_zero() && value < floor / self.warning_fraction {
            self.warnings.push(RiskAlert {
                severity: Severity::Warning,
                metric: metric.to_string(),
                message: format!("{} {} approaching minimum {}", label, value.round_dp(4), floor),
                value,
                threshold: floor,
            });
        }
    }
}

fn concentration_alerts(alerts: &mut AlertSink, snapshot: &PoolSnapshot, config: &RiskConfig) {
    let by_asset = exposure::coverage_by_asset(&snapshot.active_policies);
    let total: Decimal = by_asset.values().copied().sum();
    if total.is_zero() {
        return;
    }
    for (asset, coverage) in by_asset {
        let share = coverage / total;
        if share > config.max_asset_concentration {
            alerts.warn(RiskAlert {
                severity: Severity::Warning,
                metric: format!("concentration:{}", asset),
                message: format!(
                    "{} carries {}% of outstanding coverage",
                    asset,
                    (share * Decimal::ONE_HUNDRED).round_dp(1)
                ),
                value: share,
                threshold: config.max_asset_concentration,
            });
        }
    }
}
