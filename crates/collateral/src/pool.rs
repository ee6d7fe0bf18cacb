//! Capital pool and tranche ledger.
//!
//! Tranches are kept sorted by seniority (1 = most senior). The pool tracks
//! `total_capital_usd` incrementally so that `check_invariants` can detect
//! any drift between the aggregate and the per-tranche balances.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tranche_common::error::{PoolError, PoolResult};
use tranche_common::types::Policy;

use crate::curve::BondingCurve;

pub const BPS_DENOMINATOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// One risk layer of the waterfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tranche {
    pub tranche_id: String,
    /// 1 = most senior (last to lose), N = most junior (first to lose)
    pub seniority: u8,
    pub curve: BondingCurve,
    pub target_yield_bps: Decimal,
    pub allocated_capital: Decimal,
    pub accumulated_losses: Decimal,
    pub accumulated_yields: Decimal,
    pub lp_token_supply: Decimal,
    /// Desired share of pool capital
    pub target_weight_bps: Decimal,
    /// Hard cap on share of pool capital
    pub max_weight_bps: Decimal,
    /// Yield received in the current premium period
    pub period_yield_accrued: Decimal,
    /// Number of yield/loss events observed
    pub event_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Start of the tranche's performance record
    pub inception_at: DateTime<Utc>,
}

impl Tranche {
    /// Capital per LP token; 1 for an empty tranche.
    pub fn nav_per_token(&self) -> Decimal {
        if self.lp_token_supply.is_zero() || self.allocated_capital.is_zero() {
            Decimal::ONE
        } else {
            self.allocated_capital / self.lp_token_supply
        }
    }

    /// Target yield for one premium period of `period_days`.
    pub fn period_target(&self, period_days: u32) -> Decimal {
        self.allocated_capital * self.target_yield_bps / BPS_DENOMINATOR
            * Decimal::from(period_days)
            / Decimal::from(365)
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.event_count += 1;
        self.last_activity_at = Some(now);
    }
}

/// Parameters for creating a tranche at pool initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheSpec {
    pub tranche_id: String,
    pub seniority: u8,
    pub curve: BondingCurve,
    pub initial_capital: Decimal,
    pub target_weight_bps: Decimal,
    pub max_weight_bps: Decimal,
    /// Carried over when restoring an existing tranche; defaults to pool creation time
    #[serde(default)]
    pub inception_at: Option<DateTime<Utc>>,
}

impl TrancheSpec {
    pub fn new(
        tranche_id: impl Into<String>,
        seniority: u8,
        curve: BondingCurve,
        initial_capital: Decimal,
    ) -> Self {
        Self {
            tranche_id: tranche_id.into(),
            seniority,
            curve,
            initial_capital,
            target_weight_bps: Decimal::ZERO,
            max_weight_bps: BPS_DENOMINATOR,
            inception_at: None,
        }
    }

    pub fn with_weights(mut self, target_bps: Decimal, max_bps: Decimal) -> Self {
        self.target_weight_bps = target_bps;
        self.max_weight_bps = max_bps;
        self
    }

    /// Canonical six-layer waterfall, most senior first.
    ///
    /// `capitals` are given in the same order: BTC, SNR, MEZZ, JNR, JNR+, EQT.
    pub fn default_layout(capitals: [Decimal; 6]) -> Vec<TrancheSpec> {
        let bps = |v: i64| Decimal::from(v);
        let layout = [
            ("BTC", BondingCurve::Flat { apy_bps: bps(300) }, 1_500, 3_000),
            (
                "SNR",
                BondingCurve::Logarithmic {
                    min_bps: bps(400),
                    max_bps: bps(800),
                },
                2_000,
                3_500,
            ),
            (
                "MEZZ",
                BondingCurve::Linear {
                    min_bps: bps(600),
                    max_bps: bps(1_200),
                },
                2_000,
                3_500,
            ),
            (
                "JNR",
                BondingCurve::Sigmoidal {
                    min_bps: bps(900),
                    max_bps: bps(1_800),
                },
                1_500,
                3_000,
            ),
            (
                "JNR+",
                BondingCurve::Quadratic {
                    min_bps: bps(1_200),
                    max_bps: bps(2_500),
                },
                1_500,
                3_000,
            ),
            (
                "EQT",
                BondingCurve::Exponential {
                    min_bps: bps(1_500),
                    max_bps: bps(4_000),
                },
                1_500,
                3_000,
            ),
        ];

        layout
            .into_iter()
            .zip(capitals)
            .enumerate()
            .map(|(i, ((id, curve, target, max), capital))| {
                TrancheSpec::new(id, (i + 1) as u8, curve, capital)
                    .with_weights(bps(target), bps(max))
            })
            .collect()
    }
}

/// The aggregate capital ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalPool {
    pub total_capital_usd: Decimal,
    pub usd_reserves: Decimal,
    pub float_asset_units: Decimal,
    pub float_cost_basis_usd: Decimal,
    pub total_coverage_sold_usd: Decimal,
    /// Sorted by ascending seniority number (most senior first)
    pub virtual_tranches: Vec<Tranche>,
}

impl CapitalPool {
    /// Build a pool from tranche specs. LP tokens are minted 1:1 with initial capital.
    pub fn new(
        specs: Vec<TrancheSpec>,
        usd_reserves: Decimal,
        float_asset_units: Decimal,
        float_cost_basis_usd: Decimal,
    ) -> PoolResult<Self> {
        if specs.is_empty() {
            return Err(PoolError::Validation(
                "pool needs at least one tranche".to_string(),
            ));
        }
        if usd_reserves < Decimal::ZERO
            || float_asset_units < Decimal::ZERO
            || float_cost_basis_usd < Decimal::ZERO
        {
            return Err(PoolError::Validation(
                "reserves and float holdings must be non-negative".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut seniorities = HashSet::new();
        let mut tranches = Vec::with_capacity(specs.len());
        let created_at = Utc::now();

        for spec in specs {
            spec.curve.validate()?;
            if spec.initial_capital < Decimal::ZERO {
                return Err(PoolError::Validation(format!(
                    "tranche {} has negative initial capital",
                    spec.tranche_id
                )));
            }
            if spec.seniority == 0 {
                return Err(PoolError::Validation(format!(
                    "tranche {} seniority must start at 1",
                    spec.tranche_id
                )));
            }
            if !ids.insert(spec.tranche_id.clone()) {
                return Err(PoolError::Validation(format!(
                    "duplicate tranche id {}",
                    spec.tranche_id
                )));
            }
            if !seniorities.insert(spec.seniority) {
                return Err(PoolError::Validation(format!(
                    "duplicate seniority {}",
                    spec.seniority
                )));
            }

            tranches.push(Tranche {
                target_yield_bps: spec.curve.apy_bps(Decimal::ZERO),
                tranche_id: spec.tranche_id,
                seniority: spec.seniority,
                curve: spec.curve,
                allocated_capital: spec.initial_capital,
                accumulated_losses: Decimal::ZERO,
                accumulated_yields: Decimal::ZERO,
                lp_token_supply: spec.initial_capital,
                target_weight_bps: spec.target_weight_bps,
                max_weight_bps: spec.max_weight_bps,
                period_yield_accrued: Decimal::ZERO,
                event_count: 0,
                last_activity_at: None,
                inception_at: spec.inception_at.unwrap_or(created_at),
            });
        }

        tranches.sort_by_key(|t| t.seniority);
        let total = tranches.iter().map(|t| t.allocated_capital).sum();

        Ok(Self {
            total_capital_usd: total,
            usd_reserves,
            float_asset_units,
            float_cost_basis_usd,
            total_coverage_sold_usd: Decimal::ZERO,
            virtual_tranches: tranches,
        })
    }

    pub fn tranche(&self, tranche_id: &str) -> Option<&Tranche> {
        self.virtual_tranches
            .iter()
            .find(|t| t.tranche_id == tranche_id)
    }

    pub(crate) fn tranche_index(&self, tranche_id: &str) -> PoolResult<usize> {
        self.virtual_tranches
            .iter()
            .position(|t| t.tranche_id == tranche_id)
            .ok_or_else(|| PoolError::TrancheNotFound(tranche_id.to_string()))
    }

    /// Most junior tranche (first to lose, receives excess yield).
    pub fn most_junior(&self) -> Option<&Tranche> {
        self.virtual_tranches.last()
    }

    pub fn tranche_capital_sum(&self) -> Decimal {
        self.virtual_tranches
            .iter()
            .map(|t| t.allocated_capital)
            .sum()
    }

    /// Coverage sold / capital. `None` when coverage is outstanding against zero capital.
    pub fn ltv(&self) -> Option<Decimal> {
        ratio(self.total_coverage_sold_usd, self.total_capital_usd)
    }

    /// LTV with coverage outstanding against zero capital reported as `Decimal::MAX`.
    pub fn ltv_or_max(&self) -> Decimal {
        self.ltv().unwrap_or(Decimal::MAX)
    }

    pub fn reserve_ratio(&self) -> Decimal {
        ratio(self.usd_reserves, self.total_capital_usd).unwrap_or(Decimal::ZERO)
    }

    /// Utilization for bonding curves: LTV clamped to `[0, 1]`.
    pub fn utilization(&self) -> Decimal {
        self.ltv_or_max().clamp(Decimal::ZERO, Decimal::ONE)
    }

    /// Weighted-average cost of one float unit.
    pub fn float_cost_per_unit(&self) -> Option<Decimal> {
        if self.float_asset_units.is_zero() {
            None
        } else {
            Some(self.float_cost_basis_usd / self.float_asset_units)
        }
    }

    /// Share of pool capital held by a tranche, in bps.
    pub fn weight_bps(&self, tranche: &Tranche) -> Decimal {
        ratio(tranche.allocated_capital, self.total_capital_usd)
            .map(|r| r * BPS_DENOMINATOR)
            .unwrap_or(Decimal::ZERO)
    }

    /// Verify capital conservation and non-negativity.
    pub fn check_invariants(&self) -> PoolResult<()> {
        let sum = self.tranche_capital_sum();
        if sum != self.total_capital_usd {
            return Err(PoolError::InvariantViolation(format!(
                "total capital {} != tranche sum {}",
                self.total_capital_usd, sum
            )));
        }
        for tranche in &self.virtual_tranches {
            if tranche.allocated_capital < Decimal::ZERO {
                return Err(PoolError::InvariantViolation(format!(
                    "tranche {} capital is negative: {}",
                    tranche.tranche_id, tranche.allocated_capital
                )));
            }
            if tranche.lp_token_supply < Decimal::ZERO {
                return Err(PoolError::InvariantViolation(format!(
                    "tranche {} LP supply is negative",
                    tranche.tranche_id
                )));
            }
        }
        if self.usd_reserves < Decimal::ZERO
            || self.float_asset_units < Decimal::ZERO
            || self.total_coverage_sold_usd < Decimal::ZERO
        {
            return Err(PoolError::InvariantViolation(
                "pool reserves, float or coverage went negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// `numerator / denominator`; zero over zero is zero, anything else over zero is `None`.
pub fn ratio(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        if numerator.is_zero() {
            Some(Decimal::ZERO)
        } else {
            None
        }
    } else {
        numerator.checked_div(denominator)
    }
}

/// Read-only view handed to the risk engine each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool: CapitalPool,
    /// Active policies, ordered by start time then id
    pub active_policies: Vec<Policy>,
    pub halted: bool,
    /// Incremented on every mutation
    pub version: u64,
    pub taken_at: DateTime<Utc>,
}
