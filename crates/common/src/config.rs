use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Waterfall and ledger settings for the collateral manager.
#[derive(Debug, Clone, Deserialize)]
pub struct CollateralConfig {
    /// Loan-to-value ceiling for new coverage (coverage sold / capital)
    pub max_ltv: Decimal,

    /// Length of a premium period in days; target yields are pro-rated over it
    pub premium_period_days: u32,

    /// Rolling 24h loss, as a fraction of capital, that trips the circuit breaker
    pub circuit_breaker_loss_pct: Decimal,

    /// Ledger confirmation attempts before a pending mutation is rolled back
    pub ledger_max_retries: u32,

    /// Base delay for exponential backoff between ledger attempts
    pub ledger_retry_base_ms: u64,
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            max_ltv: dec!(0.8),
            premium_period_days: 30,
            circuit_breaker_loss_pct: dec!(0.25),
            ledger_max_retries: 5,
            ledger_retry_base_ms: 200,
        }
    }
}

/// A named multiplier applied to scenario shocks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StressScenario {
    pub name: String,
    pub severity: f64,
}

impl StressScenario {
    pub fn new(name: impl Into<String>, severity: f64) -> Self {
        Self {
            name: name.into(),
            severity,
        }
    }
}

/// Thresholds for the risk monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// LTV above which a breach alert is raised
    pub max_ltv: Decimal,

    /// Reserve ratio below which a breach alert is raised
    pub min_reserve_ratio: Decimal,

    /// Stress loss / capital ratio that counts as a breach
    pub stress_breach_ratio: Decimal,

    /// Fraction of a hard limit at which a warning is raised (e.g. 0.8 = 80% of the way)
    pub warning_fraction: Decimal,

    /// Maximum share of total coverage written on a single insured asset
    pub max_asset_concentration: Decimal,

    /// Price history older than this is stale
    pub max_price_age_secs: i64,

    pub stress_scenarios: Vec<StressScenario>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_ltv: dec!(0.8),
            min_reserve_ratio: dec!(0.2),
            stress_breach_ratio: dec!(0.5),
            warning_fraction: dec!(0.8),
            max_asset_concentration: dec!(0.5),
            max_price_age_secs: 300,
            stress_scenarios: vec![
                StressScenario::new("base", 1.0),
                StressScenario::new("severe", 1.5),
                StressScenario::new("extreme", 2.0),
            ],
        }
    }
}

/// Float rebalancing policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceConfig {
    /// Shortfalls at or below this amount do not trigger a sale
    pub shortfall_buffer_usd: Decimal,

    /// Extra proceeds targeted on top of the shortfall (0.1 = 10%)
    pub sell_safety_margin: Decimal,

    /// Reserve ratio the rebalancer steers toward
    pub target_reserve_ratio: Decimal,

    /// Reserves must exceed target by this much before buying
    pub reserve_band: Decimal,

    /// Float must trade this far below cost basis before buying (0.05 = 5%)
    pub hysteresis_margin: Decimal,

    /// No buys above this annualized volatility
    pub max_buy_volatility: f64,

    /// Largest single buy as a fraction of total capital
    pub max_buy_fraction: Decimal,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            shortfall_buffer_usd: dec!(10000),
            sell_safety_margin: dec!(0.1),
            target_reserve_ratio: dec!(0.4),
            reserve_band: dec!(0.05),
            hysteresis_margin: dec!(0.05),
            max_buy_volatility: 1.0,
            max_buy_fraction: dec!(0.1),
        }
    }
}

/// Cross-tranche arbitrage detection.
#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrageConfig {
    /// Minimum realized yield spread between the pair
    pub min_spread_bps: Decimal,

    /// Window over which accumulated yields/losses are annualized
    pub observation_days: u32,

    /// Confidence halves for every half-life of tranche inactivity
    pub recency_half_life_hours: f64,

    /// Sample count at which the sample factor reaches 0.5
    pub sample_saturation: f64,

    /// Opportunities below this confidence are dropped
    pub min_confidence: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            min_spread_bps: dec!(100),
            observation_days: 30,
            recency_half_life_hours: 24.0,
            sample_saturation: 20.0,
            min_confidence: 0.0,
        }
    }
}

/// Daemon cadence and emergency limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub risk_interval_ms: u64,
    pub rebalance_interval_ms: u64,
    pub arbitrage_interval_ms: u64,
    pub health_interval_ms: u64,
    pub expiry_interval_ms: u64,

    /// LTV at which the health check halts new coverage
    pub max_ltv_shutdown: Decimal,

    /// Consecutive cycles a rebalance must be recommended before it is applied
    pub rebalance_confirm_cycles: u64,

    /// Apply the top arbitrage opportunity automatically
    pub auto_apply_arbitrage: bool,

    pub min_apply_confidence: f64,

    /// Identical alerts are suppressed for this long
    pub alert_cooldown_secs: u64,

    /// Capacity of the published event channel
    pub event_buffer: usize,
}

impl SchedulerConfig {
    pub fn risk_interval(&self) -> Duration {
        Duration::from_millis(self.risk_interval_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn arbitrage_interval(&self) -> Duration {
        Duration::from_millis(self.arbitrage_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            risk_interval_ms: 5_000,
            rebalance_interval_ms: 15_000,
            arbitrage_interval_ms: 60_000,
            health_interval_ms: 2_000,
            expiry_interval_ms: 60_000,
            max_ltv_shutdown: dec!(0.95),
            rebalance_confirm_cycles: 2,
            auto_apply_arbitrage: false,
            min_apply_confidence: 0.6,
            alert_cooldown_secs: 300,
            event_buffer: 256,
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub collateral: CollateralConfig,
    pub risk: RiskConfig,
    pub rebalance: RebalanceConfig,
    pub arbitrage: ArbitrageConfig,
    pub scheduler: SchedulerConfig,

    /// JSON file describing the initial tranche layout and reserves
    pub pool_seed_path: Option<String>,

    /// JSON file with an initial market data snapshot
    pub market_seed_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables keep their defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let d = AppConfig::default();

        Ok(Self {
            collateral: CollateralConfig {
                max_ltv: env_or("COLLATERAL_MAX_LTV", d.collateral.max_ltv)?,
                premium_period_days: env_or(
                    "PREMIUM_PERIOD_DAYS",
                    d.collateral.premium_period_days,
                )?,
                circuit_breaker_loss_pct: env_or(
                    "CIRCUIT_BREAKER_LOSS_PCT",
                    d.collateral.circuit_breaker_loss_pct,
                )?,
                ledger_max_retries: env_or("LEDGER_MAX_RETRIES", d.collateral.ledger_max_retries)?,
                ledger_retry_base_ms: env_or(
                    "LEDGER_RETRY_BASE_MS",
                    d.collateral.ledger_retry_base_ms,
                )?,
            },
            risk: RiskConfig {
                max_ltv: env_or("RISK_MAX_LTV", d.risk.max_ltv)?,
                min_reserve_ratio: env_or("RISK_MIN_RESERVE_RATIO", d.risk.min_reserve_ratio)?,
                stress_breach_ratio: env_or(
                    "RISK_STRESS_BREACH_RATIO",
                    d.risk.stress_breach_ratio,
                )?,
                warning_fraction: env_or("RISK_WARNING_FRACTION", d.risk.warning_fraction)?,
                max_asset_concentration: env_or(
                    "RISK_MAX_ASSET_CONCENTRATION",
                    d.risk.max_asset_concentration,
                )?,
                max_price_age_secs: env_or("RISK_MAX_PRICE_AGE_SECS", d.risk.max_price_age_secs)?,
                stress_scenarios: match std::env::var("RISK_STRESS_SCENARIOS") {
                    Ok(raw) => parse_stress_scenarios(&raw)?,
                    Err(_) => d.risk.stress_scenarios,
                },
            },
            rebalance: RebalanceConfig {
                shortfall_buffer_usd: env_or(
                    "REBALANCE_SHORTFALL_BUFFER_USD",
                    d.rebalance.shortfall_buffer_usd,
                )?,
                sell_safety_margin: env_or(
                    "REBALANCE_SELL_SAFETY_MARGIN",
                    d.rebalance.sell_safety_margin,
                )?,
                target_reserve_ratio: env_or(
                    "REBALANCE_TARGET_RESERVE_RATIO",
                    d.rebalance.target_reserve_ratio,
                )?,
                reserve_band: env_or("REBALANCE_RESERVE_BAND", d.rebalance.reserve_band)?,
                hysteresis_margin: env_or(
                    "REBALANCE_HYSTERESIS_MARGIN",
                    d.rebalance.hysteresis_margin,
                )?,
                max_buy_volatility: env_or(
                    "REBALANCE_MAX_BUY_VOLATILITY",
                    d.rebalance.max_buy_volatility,
                )?,
                max_buy_fraction: env_or(
                    "REBALANCE_MAX_BUY_FRACTION",
                    d.rebalance.max_buy_fraction,
                )?,
            },
            arbitrage: ArbitrageConfig {
                min_spread_bps: env_or("ARBITRAGE_MIN_SPREAD_BPS", d.arbitrage.min_spread_bps)?,
                observation_days: env_or(
                    "ARBITRAGE_OBSERVATION_DAYS",
                    d.arbitrage.observation_days,
                )?,
                recency_half_life_hours: env_or(
                    "ARBITRAGE_RECENCY_HALF_LIFE_HOURS",
                    d.arbitrage.recency_half_life_hours,
                )?,
                sample_saturation: env_or(
                    "ARBITRAGE_SAMPLE_SATURATION",
                    d.arbitrage.sample_saturation,
                )?,
                min_confidence: env_or("ARBITRAGE_MIN_CONFIDENCE", d.arbitrage.min_confidence)?,
            },
            scheduler: SchedulerConfig {
                risk_interval_ms: env_or("RISK_INTERVAL_MS", d.scheduler.risk_interval_ms)?,
                rebalance_interval_ms: env_or(
                    "REBALANCE_INTERVAL_MS",
                    d.scheduler.rebalance_interval_ms,
                )?,
                arbitrage_interval_ms: env_or(
                    "ARBITRAGE_INTERVAL_MS",
                    d.scheduler.arbitrage_interval_ms,
                )?,
                health_interval_ms: env_or("HEALTH_INTERVAL_MS", d.scheduler.health_interval_ms)?,
                expiry_interval_ms: env_or("EXPIRY_INTERVAL_MS", d.scheduler.expiry_interval_ms)?,
                max_ltv_shutdown: env_or("MAX_LTV_SHUTDOWN", d.scheduler.max_ltv_shutdown)?,
                rebalance_confirm_cycles: env_or(
                    "REBALANCE_CONFIRM_CYCLES",
                    d.scheduler.rebalance_confirm_cycles,
                )?,
                auto_apply_arbitrage: env_or(
                    "AUTO_APPLY_ARBITRAGE",
                    d.scheduler.auto_apply_arbitrage,
                )?,
                min_apply_confidence: env_or(
                    "MIN_APPLY_CONFIDENCE",
                    d.scheduler.min_apply_confidence,
                )?,
                alert_cooldown_secs: env_or("ALERT_COOLDOWN_SECS", d.scheduler.alert_cooldown_secs)?,
                event_buffer: env_or("EVENT_BUFFER", d.scheduler.event_buffer)?,
            },
            pool_seed_path: std::env::var("POOL_SEED_PATH").ok(),
            market_seed_path: std::env::var("MARKET_SEED_PATH").ok(),
        })
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.collateral.max_ltv <= Decimal::ZERO {
            anyhow::bail!("COLLATERAL_MAX_LTV must be positive");
        }
        if self.scheduler.max_ltv_shutdown < self.collateral.max_ltv {
            anyhow::bail!("MAX_LTV_SHUTDOWN must not be below COLLATERAL_MAX_LTV");
        }
        if self.collateral.premium_period_days == 0 {
            anyhow::bail!("PREMIUM_PERIOD_DAYS must be at least 1");
        }
        if self.arbitrage.observation_days == 0 {
            anyhow::bail!("ARBITRAGE_OBSERVATION_DAYS must be at least 1");
        }
        let intervals = [
            self.scheduler.risk_interval_ms,
            self.scheduler.rebalance_interval_ms,
            self.scheduler.arbitrage_interval_ms,
            self.scheduler.health_interval_ms,
            self.scheduler.expiry_interval_ms,
        ];
        if intervals.contains(&0) {
            anyhow::bail!("subsystem intervals must be non-zero");
        }
        if self.scheduler.event_buffer == 0 {
            anyhow::bail!("EVENT_BUFFER must be non-zero");
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `name:severity` pairs separated by commas, e.g. `base:1.0,severe:1.5`.
fn parse_stress_scenarios(raw: &str) -> anyhow::Result<Vec<StressScenario>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let (name, severity) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("RISK_STRESS_SCENARIOS entry '{}' must be name:severity", entry))?;
            let severity: f64 = severity.trim().parse().map_err(|_| {
                anyhow::anyhow!("RISK_STRESS_SCENARIOS severity for '{}' must be a valid f64", name)
            })?;
            Ok(StressScenario::new(name.trim(), severity))
        })
        .collect()
}
