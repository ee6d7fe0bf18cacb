//! Startup state: the initial pool layout and market inputs, loaded from JSON.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tranche_collateral::{CapitalPool, TrancheSpec};
use tranche_common::error::PoolResult;
use tranche_common::types::MarketData;

/// Initial pool composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSeed {
    pub usd_reserves: Decimal,
    #[serde(default)]
    pub float_asset_units: Decimal,
    #[serde(default)]
    pub float_cost_basis_usd: Decimal,
    pub tranches: Vec<TrancheSpec>,
}

impl PoolSeed {
    /// Six-layer pool with $7.2M of capital, 40% of it held as USD reserves.
    pub fn default_layout() -> Self {
        let capitals = [1_300_000, 1_200_000, 1_300_000, 1_200_000, 1_200_000, 1_000_000]
            .map(Decimal::from);
        Self {
            usd_reserves: Decimal::from(2_880_000),
            float_asset_units: Decimal::ZERO,
            float_cost_basis_usd: Decimal::ZERO,
            tranches: TrancheSpec::default_layout(capitals),
        }
    }

    pub fn into_pool(self) -> PoolResult<CapitalPool> {
        CapitalPool::new(
            self.tranches,
            self.usd_reserves,
            self.float_asset_units,
            self.float_cost_basis_usd,
        )
    }
}

/// Load the pool seed at `path`, or the default layout when no path is configured.
pub fn load_pool_seed(path: Option<&str>) -> anyhow::Result<PoolSeed> {
    match path {
        Some(path) => read_json(Path::new(path)),
        None => {
            tracing::info!("No POOL_SEED_PATH set, using default six-tranche layout");
            Ok(PoolSeed::default_layout())
        }
    }
}

/// Load initial market data at `path`, or an empty ETH-float market.
pub fn load_market_seed(path: Option<&str>) -> anyhow::Result<MarketData> {
    match path {
        Some(path) => read_json(Path::new(path)),
        None => Ok(MarketData {
            float_asset: "ETH".to_string(),
            ..MarketData::default()
        }),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_layout_builds() {
        let pool = PoolSeed::default_layout().into_pool().unwrap();
        assert_eq!(pool.virtual_tranches.len(), 6);
        assert_eq!(pool.total_capital_usd, dec!(7200000));
        assert_eq!(pool.reserve_ratio(), dec!(0.4));
    }

    #[test]
    fn test_seed_parses_from_json() {
        let json = r#"{
            "usd_reserves": "500",
            "tranches": [
                {
                    "tranche_id": "SNR",
                    "seniority": 1,
                    "curve": { "kind": "flat", "apy_bps": "300" },
                    "initial_capital": "1000",
                    "target_weight_bps": "10000",
                    "max_weight_bps": "10000"
                }
            ]
        }"#;
        let seed: PoolSeed = serde_json::from_str(json).unwrap();
        assert_eq!(seed.float_asset_units, Decimal::ZERO);
        let pool = seed.into_pool().unwrap();
        assert_eq!(pool.total_capital_usd, dec!(1000));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_pool_seed(Some("/nonexistent/pool.json")).is_err());
    }

    #[test]
    fn test_market_default_has_float_asset() {
        let market = load_market_seed(None).unwrap();
        assert_eq!(market.float_asset, "ETH");
    }
}
