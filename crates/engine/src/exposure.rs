//! Parametric exposure model shared by the risk monitor and the rebalancer.
//!
//! A scenario is a set of asset prices. The pool's loss under a scenario is
//! the parametric payout owed on every active policy plus the mark-down of
//! the float holdings against the current price.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use tranche_collateral::PoolSnapshot;
use tranche_common::types::{Policy, PriceScenario};

/// Total payout owed on active policies if assets trade at `prices`.
///
/// Policies on assets missing from `prices` contribute nothing.
pub fn scenario_payout(policies: &[Policy], prices: &BTreeMap<String, Decimal>) -> Decimal {
    policies
        .iter()
        .filter(|p| p.is_active())
        .filter_map(|p| prices.get(&p.insured_asset).map(|price| p.parametric_payout(*price)))
        .sum()
}

/// Worst payout across the supplied scenarios; zero when there are none.
pub fn worst_scenario_payout(policies: &[Policy], scenarios: &[PriceScenario]) -> Decimal {
    scenarios
        .iter()
        .map(|s| scenario_payout(policies, &s.prices))
        .max()
        .unwrap_or(Decimal::ZERO)
}

/// Re-apply a scenario as relative shocks to current prices, scaled by `severity`.
///
/// Shock = `scenario / current − 1`; shocked = `current × (1 + shock × severity)`,
/// floored at zero. Assets without a usable current price take the scenario price.
pub fn shocked_prices(
    current: &BTreeMap<String, Decimal>,
    scenario: &PriceScenario,
    severity: Decimal,
) -> BTreeMap<String, Decimal> {
    let mut shocked = current.clone();
    for (asset, target) in &scenario.prices {
        let price = match current.get(asset) {
            Some(now) if *now > Decimal::ZERO => {
                let shock = *target / *now - Decimal::ONE;
                *now * (Decimal::ONE + shock * severity)
            }
            _ => *target,
        };
        shocked.insert(asset.clone(), price.max(Decimal::ZERO));
    }
    shocked
}

/// Apply per-asset returns to current prices, floored at zero.
pub fn apply_returns(
    current: &BTreeMap<String, Decimal>,
    returns: &BTreeMap<String, Decimal>,
) -> BTreeMap<String, Decimal> {
    let mut moved = current.clone();
    for (asset, r) in returns {
        if let Some(price) = current.get(asset) {
            moved.insert(
                asset.clone(),
                (*price * (Decimal::ONE + *r)).max(Decimal::ZERO),
            );
        }
    }
    moved
}

/// Loss on float holdings if the float moves from `current` to `moved`. Gains are ignored.
pub fn float_markdown(float_units: Decimal, current: Decimal, moved: Decimal) -> Decimal {
    (float_units * (current - moved)).max(Decimal::ZERO)
}

/// Payout plus float mark-down for the pool in `snapshot` at `moved` prices.
pub fn pool_loss(
    snapshot: &PoolSnapshot,
    current: &BTreeMap<String, Decimal>,
    moved: &BTreeMap<String, Decimal>,
    float_asset: &str,
) -> Decimal {
    let payout = scenario_payout(&snapshot.active_policies, moved);
    let markdown = match (current.get(float_asset), moved.get(float_asset)) {
        (Some(now), Some(then)) => float_markdown(snapshot.pool.float_asset_units, *now, *then),
        _ => Decimal::ZERO,
    };
    payout + markdown
}

/// Outstanding coverage grouped by insured asset.
pub fn coverage_by_asset(policies: &[Policy]) -> BTreeMap<String, Decimal> {
    let mut totals = BTreeMap::new();
    for policy in policies.iter().filter(|p| p.is_active()) {
        *totals
            .entry(policy.insured_asset.clone())
            .or_insert(Decimal::ZERO) += policy.coverage_amount;
    }
    totals
}
