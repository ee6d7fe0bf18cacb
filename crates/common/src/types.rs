use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Periodic subsystems scheduled by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    RiskMonitor,
    Rebalancer,
    Arbitrage,
    HealthCheck,
    Expiry,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::RiskMonitor,
        Subsystem::Rebalancer,
        Subsystem::Arbitrage,
        Subsystem::HealthCheck,
        Subsystem::Expiry,
    ];
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::RiskMonitor => write!(f, "risk_monitor"),
            Subsystem::Rebalancer => write!(f, "rebalancer"),
            Subsystem::Arbitrage => write!(f, "arbitrage"),
            Subsystem::HealthCheck => write!(f, "health_check"),
            Subsystem::Expiry => write!(f, "expiry"),
        }
    }
}

/// Lifecycle of an insured position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Expired,
    Claimed,
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyStatus::Active => write!(f, "active"),
            PolicyStatus::Expired => write!(f, "expired"),
            PolicyStatus::Claimed => write!(f, "claimed"),
        }
    }
}

/// An insured position written against the pool.
///
/// Payout is parametric: it scales linearly from zero at `trigger_price`
/// to the full `coverage_amount` at `floor_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: Uuid,
    pub policyholder: String,
    pub insured_asset: String,
    pub coverage_amount: Decimal,
    pub premium_paid: Decimal,
    pub trigger_price: Decimal,
    pub floor_price: Decimal,
    pub start_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub status: PolicyStatus,
    pub payout_amount: Option<Decimal>,
    pub payout_time: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }

    /// Parametric payout owed if `insured_asset` trades at `price`.
    pub fn parametric_payout(&self, price: Decimal) -> Decimal {
        let band = self.trigger_price - self.floor_price;
        if band <= Decimal::ZERO || price >= self.trigger_price {
            return Decimal::ZERO;
        }
        if price <= self.floor_price {
            return self.coverage_amount;
        }
        let fraction = (self.trigger_price - price) / band;
        (self.coverage_amount * fraction).min(self.coverage_amount)
    }
}

/// Policy lifecycle events delivered by the policy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEvent {
    PolicyCreated { policy: Policy },
    PolicyExpired { policy_id: Uuid },
    ClaimApproved { policy_id: Uuid, amount: Decimal },
}

/// One observation in a rolling price series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// A named set of `(asset, price)` pairs used for stress evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceScenario {
    pub name: String,
    pub prices: BTreeMap<String, Decimal>,
}

impl PriceScenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prices: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, asset: impl Into<String>, price: Decimal) -> Self {
        self.prices.insert(asset.into(), price);
        self
    }
}

/// Validated market inputs for one cycle, passed by value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    /// Latest price per asset
    pub prices: BTreeMap<String, Decimal>,
    /// Rolling historical series per asset, oldest first
    pub history: BTreeMap<String, Vec<PricePoint>>,
    /// Asset held in kind as the volatile float
    pub float_asset: String,
    /// Annualized volatility of the float asset (e.g. 0.6 = 60%)
    pub float_volatility: f64,
    /// Scenarios supplied alongside the feed
    pub scenarios: Vec<PriceScenario>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MarketData {
    pub fn price(&self, asset: &str) -> Option<Decimal> {
        self.prices.get(asset).copied()
    }

    pub fn float_price(&self) -> Option<Decimal> {
        self.price(&self.float_asset)
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A threshold alert raised by the risk monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub severity: Severity,
    /// Metric key (e.g. `ltv`, `stress:severe:crash`), used for de-duplication
    pub metric: String,
    pub message: String,
    pub value: Decimal,
    pub threshold: Decimal,
}

/// Outcome of one stress scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    /// Configured stress scenario name
    pub scenario: String,
    /// Price scenario the shocks were derived from
    pub price_scenario: String,
    pub severity: f64,
    pub simulated_loss: Decimal,
    /// Loss divided by total capital
    pub loss_ratio: Decimal,
    pub insolvent: bool,
}

/// Risk metrics computed fresh each cycle. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub var_95: Decimal,
    pub var_99: Decimal,
    pub ltv: Decimal,
    pub reserve_ratio: Decimal,
    pub stress_test_results: Vec<StressTestResult>,
    pub breach_alerts: Vec<RiskAlert>,
    pub warning_alerts: Vec<RiskAlert>,
    pub stale_data: bool,
    pub pool_version: u64,
    pub computed_at: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn has_breach(&self) -> bool {
        !self.breach_alerts.is_empty()
    }
}

/// Direction of a float rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceKind {
    BuyFloat,
    SellFloat,
    Hold,
}

impl std::fmt::Display for RebalanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebalanceKind::BuyFloat => write!(f, "buy_float"),
            RebalanceKind::SellFloat => write!(f, "sell_float"),
            RebalanceKind::Hold => write!(f, "hold"),
        }
    }
}

/// Advisory float conversion; applied only by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub kind: RebalanceKind,
    pub usd_amount: Decimal,
    pub float_units: Decimal,
    pub expected_benefit: Decimal,
    pub reason: String,
    pub pool_version: u64,
}

impl RebalanceAction {
    pub fn hold(reason: impl Into<String>, pool_version: u64) -> Self {
        Self {
            kind: RebalanceKind::Hold,
            usd_amount: Decimal::ZERO,
            float_units: Decimal::ZERO,
            expected_benefit: Decimal::ZERO,
            reason: reason.into(),
            pool_version,
        }
    }

    pub fn is_hold(&self) -> bool {
        self.kind == RebalanceKind::Hold
    }
}

/// Advisory capital move between two tranches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    /// Tranche that should receive capital (under-allocated, over-yielding)
    pub buy_tranche: String,
    /// Tranche that should release capital (over-allocated, under-yielding)
    pub sell_tranche: String,
    pub amount: Decimal,
    pub yield_spread_bps: Decimal,
    pub expected_profit: Decimal,
    pub confidence: f64,
    pub pool_version: u64,
}
