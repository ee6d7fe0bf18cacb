//! Tranche arbitrage: detect capital sitting in the wrong tranches.
//!
//! A tranche that holds more than its target weight while under-delivering on
//! its target yield is a seller; one that holds less than its target weight
//! while over-delivering is a buyer. Each (seller, buyer) pair whose realized
//! yield spread clears the configured minimum becomes an opportunity.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use tranche_collateral::PoolSnapshot;
use tranche_collateral::pool::{BPS_DENOMINATOR, Tranche};
use tranche_common::config::ArbitrageConfig;
use tranche_common::types::ArbitrageOpportunity;

const SECS_PER_DAY: i64 = 86_400;

/// Per-tranche performance as seen by the arbitrage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheYield {
    pub tranche_id: String,
    pub realized_bps: Decimal,
    /// Realized minus target yield
    pub deviation_bps: Decimal,
    pub weight_bps: Decimal,
    /// Current weight minus target weight; positive means over-allocated
    pub weight_gap_bps: Decimal,
    pub capital: Decimal,
    pub confidence: f64,
}

/// Realized yield and weight for every funded tranche, most senior first.
pub fn tranche_yields(snapshot: &PoolSnapshot, config: &ArbitrageConfig) -> Vec<TrancheYield> {
    let pool = &snapshot.pool;
    pool.virtual_tranches
        .iter()
        .filter(|t| t.allocated_capital > Decimal::ZERO)
        .map(|t| {
            let realized_bps = (t.accumulated_yields - t.accumulated_losses) / t.allocated_capital
                * BPS_DENOMINATOR
                * annualization(t, snapshot, config);
            let weight_bps = pool.weight_bps(t);
            TrancheYield {
                tranche_id: t.tranche_id.clone(),
                realized_bps,
                deviation_bps: realized_bps - t.target_yield_bps,
                weight_bps,
                weight_gap_bps: weight_bps - t.target_weight_bps,
                capital: t.allocated_capital,
                confidence: confidence(t, snapshot, config),
            }
        })
        .collect()
}

/// Scale lifetime net yield to one year.
///
/// The record spans inception to the snapshot, never less than
/// `observation_days` so a young tranche's first premium is not blown up.
fn annualization(tranche: &Tranche, snapshot: &PoolSnapshot, config: &ArbitrageConfig) -> Decimal {
    let lived_secs = (snapshot.taken_at - tranche.inception_at).num_seconds().max(0);
    let window_secs = lived_secs.max(i64::from(config.observation_days) * SECS_PER_DAY);
    if window_secs == 0 {
        return Decimal::ONE;
    }
    Decimal::from(365 * SECS_PER_DAY) / Decimal::from(window_secs)
}

/// Recency factor (halves every half-life of inactivity) times sample factor `n / (n + k)`.
fn confidence(tranche: &Tranche, snapshot: &PoolSnapshot, config: &ArbitrageConfig) -> f64 {
    let Some(last) = tranche.last_activity_at else {
        return 0.0;
    };
    let age_hours = (snapshot.taken_at - last).num_seconds().max(0) as f64 / 3600.0;
    let recency = if config.recency_half_life_hours > 0.0 {
        0.5f64.powf(age_hours / config.recency_half_life_hours)
    } else {
        1.0
    };
    let n = tranche.event_count as f64;
    let sample = if n + config.sample_saturation > 0.0 {
        n / (n + config.sample_saturation)
    } else {
        0.0
    };
    (recency * sample).clamp(0.0, 1.0)
}

pub fn find_arbitrage_opportunities(
    snapshot: &PoolSnapshot,
    config: &ArbitrageConfig,
) -> Vec<ArbitrageOpportunity> {
    if snapshot.halted {
        return Vec::new();
    }
    let pool = &snapshot.pool;
    let total = pool.total_capital_usd;
    let yields = tranche_yields(snapshot, config);

    let sellers = yields
        .iter()
        .filter(|y| y.weight_gap_bps > Decimal::ZERO && y.deviation_bps < Decimal::ZERO);
    let mut opportunities = Vec::new();

    for sell in sellers {
        let buyers = yields
            .iter()
            .filter(|y| y.weight_gap_bps < Decimal::ZERO && y.deviation_bps > Decimal::ZERO);
        for buy in buyers {
            let spread = buy.realized_bps - sell.realized_bps;
            if spread < config.min_spread_bps {
                continue;
            }
            let Some(buy_tranche) = pool.tranche(&buy.tranche_id) else {
                continue;
            };

            let excess = sell.weight_gap_bps * total / BPS_DENOMINATOR;
            let deficit = -buy.weight_gap_bps * total / BPS_DENOMINATOR;
            let headroom =
                buy_tranche.max_weight_bps * total / BPS_DENOMINATOR - buy_tranche.allocated_capital;
            let amount = excess.min(deficit).min(headroom).min(sell.capital);
            if amount <= Decimal::ZERO {
                continue;
            }

            let confidence = sell.confidence.min(buy.confidence);
            if confidence < config.min_confidence {
                continue;
            }

            opportunities.push(ArbitrageOpportunity {
                buy_tranche: buy.tranche_id.clone(),
                sell_tranche: sell.tranche_id.clone(),
                amount,
                yield_spread_bps: spread,
                expected_profit: amount * spread / BPS_DENOMINATOR,
                confidence,
                pool_version: snapshot.version,
            });
        }
    }

    opportunities.sort_by(|a, b| {
        b.expected_profit
            .cmp(&a.expected_profit)
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.sell_tranche.cmp(&b.sell_tranche))
            .then_with(|| a.buy_tranche.cmp(&b.buy_tranche))
    });
    opportunities
}

/// Expected profit as `f64`, for logging.
pub fn profit_f64(opportunity: &ArbitrageOpportunity) -> f64 {
    opportunity.expected_profit.to_f64().unwrap_or(0.0)
}
