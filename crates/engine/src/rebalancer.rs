//! Float rebalancer: decides when to convert between USD reserves and the float asset.
//!
//! Sells are driven only by projected liquidity need, buys only by a price
//! below cost basis minus the hysteresis margin. A small price move can
//! therefore never flip a recommendation from one side to the other.

use rust_decimal::Decimal;

use tranche_collateral::PoolSnapshot;
use tranche_common::config::RebalanceConfig;
use tranche_common::types::{PriceScenario, RebalanceAction, RebalanceKind};

use crate::exposure;

/// Recommend a float conversion for the pool in `snapshot`.
///
/// Returns `None` only when the inputs cannot be evaluated (non-positive
/// float price); otherwise `Some`, with `Hold` when no action is warranted.
pub fn evaluate_rebalancing(
    snapshot: &PoolSnapshot,
    float_price: Decimal,
    float_volatility: f64,
    config: &RebalanceConfig,
    price_scenarios: &[PriceScenario],
) -> Option<RebalanceAction> {
    if float_price <= Decimal::ZERO {
        return None;
    }
    let pool = &snapshot.pool;
    let version = snapshot.version;

    let worst_payout = exposure::worst_scenario_payout(&snapshot.active_policies, price_scenarios);
    let shortfall = worst_payout - pool.usd_reserves;
    let float_value = pool.float_asset_units * float_price;

    // ---- Sell: projected liquidity shortfall ----
    if shortfall > config.shortfall_buffer_usd {
        if float_value <= Decimal::ZERO {
            return Some(RebalanceAction::hold(
                format!("shortfall {} but no float held", shortfall.round_dp(2)),
                version,
            ));
        }
        let wanted = shortfall * (Decimal::ONE + config.sell_safety_margin);
        let usd_amount = wanted.min(float_value);
        return Some(RebalanceAction {
            kind: RebalanceKind::SellFloat,
            usd_amount,
            float_units: usd_amount / float_price,
            expected_benefit: usd_amount.min(shortfall),
            reason: format!(
                "worst-case payout {} exceeds reserves {} by {} (float vol {:.2})",
                worst_payout.round_dp(2),
                pool.usd_reserves.round_dp(2),
                shortfall.round_dp(2),
                float_volatility
            ),
            pool_version: version,
        });
    }

    // ---- Buy: excess reserves and float below basis ----
    let capital = pool.total_capital_usd;
    let reserve_ratio = pool.reserve_ratio();
    let Some(basis) = pool.float_cost_per_unit() else {
        return Some(RebalanceAction::hold("no float cost basis", version));
    };

    if capital <= Decimal::ZERO
        || reserve_ratio <= config.target_reserve_ratio + config.reserve_band
    {
        return Some(RebalanceAction::hold(
            format!("reserve ratio {} within band", reserve_ratio.round_dp(4)),
            version,
        ));
    }

    let buy_below = basis * (Decimal::ONE - config.hysteresis_margin);
    if float_price >= buy_below {
        return Some(RebalanceAction::hold(
            format!(
                "float {} not below buy threshold {}",
                float_price.round_dp(4),
                buy_below.round_dp(4)
            ),
            version,
        ));
    }
    if float_volatility > config.max_buy_volatility {
        return Some(RebalanceAction::hold(
            format!("float volatility {:.2} above buy limit", float_volatility),
            version,
        ));
    }

    let excess = pool.usd_reserves - config.target_reserve_ratio * capital;
    let floor_room = pool.usd_reserves - (worst_payout + config.shortfall_buffer_usd);
    let cap = capital * config.max_buy_fraction;
    let usd_amount = excess.min(floor_room).min(cap);
    if usd_amount <= Decimal::ZERO {
        return Some(RebalanceAction::hold(
            "reserves needed for worst-case payout",
            version,
        ));
    }

    let float_units = usd_amount / float_price;
    Some(RebalanceAction {
        kind: RebalanceKind::BuyFloat,
        usd_amount,
        float_units,
        expected_benefit: float_units * (basis - float_price),
        reason: format!(
            "reserve ratio {} above target, float {} below basis {}",
            reserve_ratio.round_dp(4),
            float_price.round_dp(4),
            basis.round_dp(4)
        ),
        pool_version: version,
    })
}
