//! Market data boundary.
//!
//! Subsystems read one consistent `MarketData` value per cycle. Feed
//! ingestion is out of process; whatever writes prices goes through
//! `SharedMarketData`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use tranche_common::error::{PoolError, PoolResult};
use tranche_common::types::{MarketData, PricePoint, PriceScenario};

/// Points kept per asset in the rolling history.
pub const MAX_HISTORY_POINTS: usize = 1_440;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Latest validated market inputs.
    async fn latest(&self) -> PoolResult<MarketData>;
}

/// In-process market data store shared between the feed writer and the daemon.
#[derive(Debug, Clone, Default)]
pub struct SharedMarketData {
    inner: Arc<RwLock<MarketData>>,
}

impl SharedMarketData {
    pub fn new(initial: MarketData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Record a new observation for `asset`, appending it to the rolling history.
    pub fn set_price(
        &self,
        asset: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> PoolResult<()> {
        if price <= Decimal::ZERO {
            return Err(PoolError::Validation(format!(
                "price for {} must be positive, got {}",
                asset, price
            )));
        }
        let mut data = self.inner.write();
        let series = data.history.entry(asset.to_string()).or_default();
        if series.last().is_some_and(|p| p.timestamp > at) {
            return Err(PoolError::Validation(format!(
                "out-of-order observation for {} at {}",
                asset, at
            )));
        }
        series.push(PricePoint {
            timestamp: at,
            price,
        });
        if series.len() > MAX_HISTORY_POINTS {
            let excess = series.len() - MAX_HISTORY_POINTS;
            series.drain(..excess);
        }
        data.prices.insert(asset.to_string(), price);
        data.updated_at = Some(at);
        Ok(())
    }

    pub fn set_float_volatility(&self, volatility: f64) {
        self.inner.write().float_volatility = volatility;
    }

    pub fn set_scenarios(&self, scenarios: Vec<PriceScenario>) {
        self.inner.write().scenarios = scenarios;
    }

    pub fn replace(&self, data: MarketData) {
        *self.inner.write() = data;
    }

    pub fn prices(&self) -> BTreeMap<String, Decimal> {
        self.inner.read().prices.clone()
    }
}

#[async_trait]
impl MarketDataSource for SharedMarketData {
    async fn latest(&self) -> PoolResult<MarketData> {
        let data = self.inner.read().clone();
        if data.float_asset.is_empty() {
            return Err(PoolError::Config("market data has no float asset".to_string()));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn store() -> SharedMarketData {
        SharedMarketData::new(MarketData {
            float_asset: "ETH".to_string(),
            ..MarketData::default()
        })
    }

    #[tokio::test]
    async fn test_set_price_updates_latest_and_history() {
        let market = store();
        let now = Utc::now();
        market.set_price("ETH", dec!(2000), now).unwrap();
        market.set_price("ETH", dec!(2010), now + Duration::seconds(1)).unwrap();

        let data = market.latest().await.unwrap();
        assert_eq!(data.float_price(), Some(dec!(2010)));
        assert_eq!(data.history["ETH"].len(), 2);
        assert_eq!(data.updated_at, Some(now + Duration::seconds(1)));
    }

    #[test]
    fn test_rejects_bad_observations() {
        let market = store();
        let now = Utc::now();
        assert!(market.set_price("ETH", Decimal::ZERO, now).is_err());
        market.set_price("ETH", dec!(2000), now).unwrap();
        assert!(market.set_price("ETH", dec!(1990), now - Duration::seconds(5)).is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let market = store();
        let start = Utc::now();
        for i in 0..(MAX_HISTORY_POINTS + 10) {
            market
                .set_price("BTC", dec!(30000), start + Duration::seconds(i as i64))
                .unwrap();
        }
        assert_eq!(market.inner.read().history["BTC"].len(), MAX_HISTORY_POINTS);
    }

    #[tokio::test]
    async fn test_missing_float_asset_is_config_error() {
        let market = SharedMarketData::default();
        assert!(matches!(market.latest().await, Err(PoolError::Config(_))));
    }
}
