//! Bonding curves: tranche APY as a function of pool utilization.
//!
//! Every curve maps utilization `U ∈ [0, 1]` to an APY in basis points and is
//! clamped to its `[min, max]` band. Inputs outside `[0, 1]` are clamped first.
//! All maths is checked `Decimal`; an overflow falls back to the nearest bound.

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use tranche_common::error::{PoolError, PoolResult};

/// Steepness of the sigmoidal curve around `U = 0.5`.
const SIGMOID_STEEPNESS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BondingCurve {
    /// `APY = c`
    Flat { apy_bps: Decimal },
    /// `min + (max-min)·ln(1+U)/ln(2)`
    Logarithmic { min_bps: Decimal, max_bps: Decimal },
    /// `min + (max-min)·U`
    Linear { min_bps: Decimal, max_bps: Decimal },
    /// `min + (max-min)/(1+e^(-10(U-0.5)))`
    Sigmoidal { min_bps: Decimal, max_bps: Decimal },
    /// `min + (max-min)·U²`
    Quadratic { min_bps: Decimal, max_bps: Decimal },
    /// `min + (max-min)·(e^(2U)-1)/(e²-1)`
    Exponential { min_bps: Decimal, max_bps: Decimal },
}

impl BondingCurve {
    /// `(min, max)` APY band in bps.
    pub fn bounds(&self) -> (Decimal, Decimal) {
        match *self {
            BondingCurve::Flat { apy_bps } => (apy_bps, apy_bps),
            BondingCurve::Logarithmic { min_bps, max_bps }
            | BondingCurve::Linear { min_bps, max_bps }
            | BondingCurve::Sigmoidal { min_bps, max_bps }
            | BondingCurve::Quadratic { min_bps, max_bps }
            | BondingCurve::Exponential { min_bps, max_bps } => (min_bps, max_bps),
        }
    }

    pub fn validate(&self) -> PoolResult<()> {
        let (min, max) = self.bounds();
        if min < Decimal::ZERO {
            return Err(PoolError::Validation(format!(
                "curve minimum {} bps is negative",
                min
            )));
        }
        if min > max {
            return Err(PoolError::Validation(format!(
                "curve minimum {} bps exceeds maximum {} bps",
                min, max
            )));
        }
        Ok(())
    }

    /// APY in bps at the given utilization.
    pub fn apy_bps(&self, utilization: Decimal) -> Decimal {
        let u = utilization.clamp(Decimal::ZERO, Decimal::ONE);
        let (min, max) = self.bounds();
        let span = max - min;

        let fraction = match *self {
            BondingCurve::Flat { .. } => return min,
            BondingCurve::Logarithmic { .. } => logarithmic(u),
            BondingCurve::Linear { .. } => Some(u),
            BondingCurve::Sigmoidal { .. } => sigmoidal(u),
            BondingCurve::Quadratic { .. } => u.checked_mul(u),
            BondingCurve::Exponential { .. } => exponential(u),
        };

        // Unreachable for U in [0, 1]; fall back to the band edge nearest the input
        let fraction = fraction.unwrap_or(if u >= Decimal::new(5, 1) {
            Decimal::ONE
        } else {
            Decimal::ZERO
        });

        let apy = span
            .checked_mul(fraction.clamp(Decimal::ZERO, Decimal::ONE))
            .and_then(|v| v.checked_add(min))
            .unwrap_or(max);
        apy.clamp(min, max)
    }
}

fn logarithmic(u: Decimal) -> Option<Decimal> {
    let numerator = (Decimal::ONE + u).checked_ln()?;
    let denominator = Decimal::TWO.checked_ln()?;
    numerator.checked_div(denominator)
}

fn sigmoidal(u: Decimal) -> Option<Decimal> {
    let exponent = Decimal::from(-SIGMOID_STEEPNESS).checked_mul(u - Decimal::new(5, 1))?;
    let denominator = Decimal::ONE.checked_add(exponent.checked_exp()?)?;
    Decimal::ONE.checked_div(denominator)
}

fn exponential(u: Decimal) -> Option<Decimal> {
    let numerator = (Decimal::TWO.checked_mul(u)?).checked_exp()? - Decimal::ONE;
    let denominator = Decimal::TWO.checked_exp()? - Decimal::ONE;
    numerator.checked_div(denominator)
}
