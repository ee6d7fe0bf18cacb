//! Daemon orchestration.
//!
//! Five subsystems run on independent intervals. A cycle reads the latest
//! pool snapshot from a watch channel, computes on the blocking pool under a
//! time budget, then applies through the single writer lock after checking
//! that the pool has not moved underneath the decision.
//!
//! Ledger writes follow the two-phase model: the manager applies a pending
//! mutation under the lock, the lock is released while the ledger is called,
//! and the mutation is confirmed or rolled back afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use tranche_collateral::ledger::{Ledger, LedgerOp, RetryPolicy, submit_with_retry};
use tranche_collateral::manager::{
    CoverageReceipt, DepositReceipt, PayoutReceipt, WithdrawReceipt,
};
use tranche_collateral::{CollateralManager, PoolSnapshot};
use tranche_common::config::AppConfig;
use tranche_common::error::{PoolError, PoolResult};
use tranche_common::halt::{HaltFlag, HaltReason};
use tranche_common::types::{
    Policy, PolicyEvent, RebalanceKind, RiskSnapshot, Subsystem,
};
use tranche_engine::arbitrage::profit_f64;
use tranche_engine::hysteresis::HysteresisEngine;
use tranche_engine::risk_monitor::ensure_fresh;
use tranche_engine::{calculate_risk_metrics, evaluate_rebalancing, find_arbitrage_opportunities};

use crate::market::MarketDataSource;
use crate::metrics::{CycleOutcome, DaemonMetrics, MetricsRegistry};
use crate::processor::EventProcessor;
use crate::publisher::{DaemonEvent, Publisher};

/// Run `work` on the blocking pool, failing the cycle if it panics or overruns `budget`.
async fn compute<T, F>(subsystem: Subsystem, budget: Duration, work: F) -> PoolResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(budget, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PoolError::SubsystemCycle {
            subsystem,
            message: format!("compute task failed: {}", e),
        }),
        Err(_) => Err(PoolError::SubsystemCycle {
            subsystem,
            message: format!("compute exceeded {}ms budget", budget.as_millis()),
        }),
    }
}

/// Shared state behind every subsystem loop and every `DaemonHandle`.
pub struct DaemonState {
    config: AppConfig,
    manager: Mutex<CollateralManager>,
    snapshot_tx: watch::Sender<Arc<PoolSnapshot>>,
    halt: HaltFlag,
    ledger: Arc<dyn Ledger>,
    market: Arc<dyn MarketDataSource>,
    retry: RetryPolicy,
    publisher: Publisher,
    metrics: MetricsRegistry,
    hysteresis: parking_lot::Mutex<HysteresisEngine>,
    last_risk: parking_lot::RwLock<Option<RiskSnapshot>>,
    period_started: parking_lot::Mutex<DateTime<Utc>>,
}

impl DaemonState {
    pub fn new(
        config: AppConfig,
        manager: CollateralManager,
        ledger: Arc<dyn Ledger>,
        market: Arc<dyn MarketDataSource>,
    ) -> Self {
        let now = Utc::now();
        let halt = manager.halt_flag().clone();
        let (snapshot_tx, _) = watch::channel(Arc::new(manager.snapshot(now)));
        Self {
            retry: RetryPolicy::from_config(&config.collateral),
            publisher: Publisher::new(
                config.scheduler.event_buffer,
                config.scheduler.alert_cooldown_secs,
            ),
            hysteresis: parking_lot::Mutex::new(HysteresisEngine::new(
                config.scheduler.rebalance_confirm_cycles,
            )),
            manager: Mutex::new(manager),
            snapshot_tx,
            halt,
            ledger,
            market,
            metrics: MetricsRegistry::new(),
            last_risk: parking_lot::RwLock::new(None),
            period_started: parking_lot::Mutex::new(now),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn halt_flag(&self) -> &HaltFlag {
        &self.halt
    }

    /// Latest published pool snapshot. Never waits on writers.
    pub fn pool_snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch_pool(&self) -> watch::Receiver<Arc<PoolSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.publisher.subscribe()
    }

    pub fn metrics(&self) -> DaemonMetrics {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_registry(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn last_risk(&self) -> Option<RiskSnapshot> {
        self.last_risk.read().clone()
    }

    pub fn interval_for(&self, subsystem: Subsystem) -> Duration {
        let scheduler = &self.config.scheduler;
        match subsystem {
            Subsystem::RiskMonitor => scheduler.risk_interval(),
            Subsystem::Rebalancer => scheduler.rebalance_interval(),
            Subsystem::Arbitrage => scheduler.arbitrage_interval(),
            Subsystem::HealthCheck => scheduler.health_interval(),
            Subsystem::Expiry => scheduler.expiry_interval(),
        }
    }

    fn publish_snapshot(&self, manager: &CollateralManager) {
        self.snapshot_tx
            .send_replace(Arc::new(manager.snapshot(Utc::now())));
    }

    /// Publish the emergency if the flag went up since `was_halted` was read.
    fn note_halt(&self, was_halted: bool) {
        if !was_halted && self.halt.is_halted() {
            self.publisher.publish_halt(self.halt.reasons());
        }
    }

    // ------------------------------------------------------------------
    // Policy and LP operations
    // ------------------------------------------------------------------

    pub async fn submit_policy(&self, policy: Policy) -> PoolResult<CoverageReceipt> {
        let mut manager = self.manager.lock().await;
        let receipt = manager.allocate_coverage(policy, Utc::now())?;
        self.publish_snapshot(&manager);
        Ok(receipt)
    }

    pub async fn expire_policy(&self, policy_id: Uuid) -> PoolResult<()> {
        let mut manager = self.manager.lock().await;
        manager.expire_policy(policy_id)?;
        self.publish_snapshot(&manager);
        Ok(())
    }

    /// Pay an approved claim and settle it with the ledger.
    ///
    /// An insolvent payout still settles its partial amount before
    /// `Insolvent` is returned.
    pub async fn approve_claim(
        &self,
        policy_id: Uuid,
        amount: Decimal,
    ) -> PoolResult<PayoutReceipt> {
        let was_halted = self.halt.is_halted();
        let (result, pending) = {
            let mut manager = self.manager.lock().await;
            let result = manager.execute_payout(policy_id, amount, Utc::now());
            let pending = match &result {
                Ok(receipt) => Some((receipt.mutation_id, receipt.op.clone())),
                Err(PoolError::Insolvent { .. }) => manager.pending_for_policy(policy_id),
                Err(_) => None,
            };
            if pending.is_some() {
                self.publish_snapshot(&manager);
            }
            (result, pending)
        };
        self.note_halt(was_halted);

        if let Some((mutation_id, op)) = pending {
            self.settle(mutation_id, op).await?;
        }
        result
    }

    pub async fn deposit(&self, tranche_id: &str, amount: Decimal) -> PoolResult<DepositReceipt> {
        let receipt = {
            let mut manager = self.manager.lock().await;
            let receipt = manager.deposit(tranche_id, amount, Utc::now())?;
            self.publish_snapshot(&manager);
            receipt
        };
        self.settle(receipt.mutation_id, receipt.op.clone()).await?;
        Ok(receipt)
    }

    pub async fn withdraw(
        &self,
        tranche_id: &str,
        token_amount: Decimal,
    ) -> PoolResult<WithdrawReceipt> {
        let receipt = {
            let mut manager = self.manager.lock().await;
            let receipt = manager.withdraw(tranche_id, token_amount, Utc::now())?;
            self.publish_snapshot(&manager);
            receipt
        };
        self.settle(receipt.mutation_id, receipt.op.clone()).await?;
        Ok(receipt)
    }

    /// Submit a pending mutation to the ledger, then confirm or roll it back.
    async fn settle(&self, mutation_id: Uuid, op: LedgerOp) -> PoolResult<()> {
        let submitted = submit_with_retry(self.ledger.as_ref(), &op, self.retry).await;

        let mut manager = self.manager.lock().await;
        match submitted {
            Ok(_) => {
                manager.confirm(mutation_id)?;
                self.metrics.record_settlement(true);
                Ok(())
            }
            Err(e) => {
                let was_halted = self.halt.is_halted();
                manager.rollback(mutation_id, Utc::now())?;
                self.publish_snapshot(&manager);
                self.note_halt(was_halted);
                self.metrics.record_settlement(false);
                tracing::warn!(
                    mutation_id = %mutation_id,
                    op = op.name(),
                    error = %e,
                    "Ledger refused mutation, rolled back"
                );
                Err(PoolError::Ledger(e.to_string()))
            }
        }
    }

    /// Operator halt.
    pub async fn trigger_halt(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let manager = self.manager.lock().await;
        let newly = self.halt.trigger(HaltReason::Manual {
            reason: reason.clone(),
        });
        if newly {
            tracing::error!(reason = %reason, "EMERGENCY SHUTDOWN: operator halt");
            self.publish_snapshot(&manager);
            self.publisher.publish_halt(self.halt.reasons());
        }
        newly
    }

    /// Operator reset of the halt flag. Returns the reasons that were cleared.
    pub async fn clear_halt(&self) -> Vec<HaltReason> {
        let manager = self.manager.lock().await;
        if !self.halt.is_halted() {
            return Vec::new();
        }
        let reasons = self.halt.reasons();
        self.halt.clear();
        self.publish_snapshot(&manager);
        tracing::warn!(reasons = ?reasons, "Emergency halt cleared by operator");
        self.publisher.publish(DaemonEvent::HaltCleared {
            reasons: reasons.clone(),
        });
        reasons
    }

    // ------------------------------------------------------------------
    // Subsystem cycles
    // ------------------------------------------------------------------

    /// Run one cycle of `subsystem` and record its outcome.
    pub async fn run_cycle(&self, subsystem: Subsystem, cycle: u64) -> PoolResult<CycleOutcome> {
        self.metrics.begin(subsystem);
        let started = Instant::now();

        let result = match subsystem {
            Subsystem::RiskMonitor => self.run_risk_cycle().await,
            Subsystem::Rebalancer => self.run_rebalance_cycle(cycle).await,
            Subsystem::Arbitrage => self.run_arbitrage_cycle().await,
            Subsystem::HealthCheck => self.run_health_cycle().await,
            Subsystem::Expiry => self.run_expiry_cycle().await,
        };

        let elapsed = started.elapsed();
        self.metrics
            .record_cycle(subsystem, elapsed, self.interval_for(subsystem), &result);

        match &result {
            Ok(CycleOutcome::Completed) => tracing::debug!(
                subsystem = %subsystem,
                cycle,
                duration_ms = elapsed.as_millis() as u64,
                "Cycle completed"
            ),
            Ok(CycleOutcome::Skipped(reason)) => {
                tracing::info!(subsystem = %subsystem, cycle, reason = %reason, "Cycle skipped")
            }
            Ok(CycleOutcome::Conflict(reason)) => tracing::warn!(
                subsystem = %subsystem,
                cycle,
                reason = %reason,
                "Decision discarded, pool moved"
            ),
            Err(e) => tracing::error!(subsystem = %subsystem, cycle, error = %e, "Cycle failed"),
        }
        result
    }

    async fn run_risk_cycle(&self) -> PoolResult<CycleOutcome> {
        let snapshot = self.pool_snapshot();
        let market = self.market.latest().await?;
        let scenarios = market.scenarios.clone();
        let config = self.config.risk.clone();

        let risk = compute(
            Subsystem::RiskMonitor,
            self.interval_for(Subsystem::RiskMonitor),
            move || calculate_risk_metrics(&snapshot, &scenarios, &market, &config),
        )
        .await?;

        tracing::info!(
            var_95 = %risk.var_95,
            var_99 = %risk.var_99,
            ltv = %risk.ltv.round_dp(4),
            reserve_ratio = %risk.reserve_ratio.round_dp(4),
            breaches = risk.breach_alerts.len(),
            warnings = risk.warning_alerts.len(),
            stale = risk.stale_data,
            pool_version = risk.pool_version,
            "Risk snapshot computed"
        );
        self.publisher.publish_risk(&risk, Utc::now());
        *self.last_risk.write() = Some(risk);
        Ok(CycleOutcome::Completed)
    }

    async fn run_rebalance_cycle(&self, cycle: u64) -> PoolResult<CycleOutcome> {
        let market = self.market.latest().await?;
        let Some(price) = market.float_price() else {
            return Ok(CycleOutcome::Skipped(format!(
                "no price for float asset {}",
                market.float_asset
            )));
        };
        let now = Utc::now();
        if let Err(e) = ensure_fresh(
            &market,
            &market.float_asset,
            now,
            self.config.risk.max_price_age_secs,
        ) {
            return Ok(CycleOutcome::Skipped(e.to_string()));
        }

        let snapshot = self.pool_snapshot();
        let volatility = market.float_volatility;
        let scenarios = market.scenarios;
        let config = self.config.rebalance.clone();
        let (action, scenarios) = compute(
            Subsystem::Rebalancer,
            self.interval_for(Subsystem::Rebalancer),
            move || {
                let action = evaluate_rebalancing(&snapshot, price, volatility, &config, &scenarios);
                (action, scenarios)
            },
        )
        .await?;

        let Some(action) = action else {
            return Ok(CycleOutcome::Skipped(format!("float price {} not usable", price)));
        };
        let confirmed = self
            .hysteresis
            .lock()
            .check(Subsystem::Rebalancer, action.kind, cycle);
        if !confirmed {
            if !action.is_hold() {
                self.publisher.publish(DaemonEvent::Rebalance {
                    action,
                    applied: false,
                });
            }
            return Ok(CycleOutcome::Completed);
        }
        if action.kind == RebalanceKind::BuyFloat && self.halt.is_halted() {
            return Ok(CycleOutcome::Skipped("pool halted, buys suspended".to_string()));
        }

        let was_halted = self.halt.is_halted();
        let (result, action) = {
            let mut manager = self.manager.lock().await;
            let mut action = action;
            if manager.version() != action.pool_version {
                let current = manager.snapshot(now);
                match evaluate_rebalancing(
                    &current,
                    price,
                    volatility,
                    &self.config.rebalance,
                    &scenarios,
                ) {
                    Some(fresh) if fresh.kind == action.kind => action = fresh,
                    _ => {
                        return Ok(CycleOutcome::Conflict(format!(
                            "{} computed at version {} no longer holds at version {}",
                            action.kind,
                            action.pool_version,
                            manager.version()
                        )));
                    }
                }
            }
            let result = manager.apply_rebalance(&action, price, now);
            if !matches!(result, Err(PoolError::ApplyConflict(_) | PoolError::Validation(_))) {
                self.publish_snapshot(&manager);
            }
            (result, action)
        };
        self.note_halt(was_halted);

        match result {
            Ok(outcome) => {
                tracing::info!(
                    kind = %action.kind,
                    usd_amount = %action.usd_amount,
                    float_units = %action.float_units,
                    realized_pnl = %outcome.realized_pnl,
                    reason = %action.reason,
                    "Confirmed rebalance executed"
                );
                self.publisher.publish(DaemonEvent::Rebalance {
                    action,
                    applied: true,
                });
                Ok(CycleOutcome::Completed)
            }
            Err(PoolError::ApplyConflict(msg)) => Ok(CycleOutcome::Conflict(msg)),
            Err(e) => Err(e),
        }
    }

    async fn run_arbitrage_cycle(&self) -> PoolResult<CycleOutcome> {
        let snapshot = self.pool_snapshot();
        let config = self.config.arbitrage.clone();
        let opportunities = compute(
            Subsystem::Arbitrage,
            self.interval_for(Subsystem::Arbitrage),
            move || find_arbitrage_opportunities(&snapshot, &config),
        )
        .await?;
        if opportunities.is_empty() {
            return Ok(CycleOutcome::Completed);
        }

        let scheduler = &self.config.scheduler;
        let candidate = opportunities
            .first()
            .filter(|op| {
                scheduler.auto_apply_arbitrage && op.confidence >= scheduler.min_apply_confidence
            })
            .cloned();
        let Some(mut candidate) = candidate else {
            self.publisher.publish(DaemonEvent::Arbitrage {
                opportunities,
                applied: None,
            });
            return Ok(CycleOutcome::Completed);
        };

        {
            let mut manager = self.manager.lock().await;
            let now = Utc::now();
            if manager.version() != candidate.pool_version {
                let current = manager.snapshot(now);
                let fresh = find_arbitrage_opportunities(&current, &self.config.arbitrage)
                    .into_iter()
                    .find(|o| {
                        o.sell_tranche == candidate.sell_tranche
                            && o.buy_tranche == candidate.buy_tranche
                            && o.confidence >= scheduler.min_apply_confidence
                    });
                match fresh {
                    Some(fresh) => candidate = fresh,
                    None => {
                        return Ok(CycleOutcome::Conflict(format!(
                            "{} -> {} computed at version {} no longer holds at version {}",
                            candidate.sell_tranche,
                            candidate.buy_tranche,
                            candidate.pool_version,
                            manager.version()
                        )));
                    }
                }
            }
            match manager.reallocate_capital(
                &candidate.sell_tranche,
                &candidate.buy_tranche,
                candidate.amount,
                now,
            ) {
                Ok(()) => self.publish_snapshot(&manager),
                Err(PoolError::ApplyConflict(msg)) => return Ok(CycleOutcome::Conflict(msg)),
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            from = %candidate.sell_tranche,
            to = %candidate.buy_tranche,
            amount = %candidate.amount,
            expected_profit = profit_f64(&candidate),
            confidence = candidate.confidence,
            "Arbitrage reallocation applied"
        );
        self.publisher.publish(DaemonEvent::Arbitrage {
            opportunities,
            applied: Some(candidate),
        });
        Ok(CycleOutcome::Completed)
    }

    async fn run_health_cycle(&self) -> PoolResult<CycleOutcome> {
        let now = Utc::now();
        let was_halted = self.halt.is_halted();
        {
            let mut manager = self.manager.lock().await;
            manager.pool().check_invariants()?;

            let ltv = manager.pool().ltv_or_max();
            let limit = self.config.scheduler.max_ltv_shutdown;
            if ltv > limit {
                let newly = self.halt.trigger(HaltReason::LtvLimit {
                    ltv: ltv.round_dp(4).to_string(),
                    limit: limit.to_string(),
                });
                if newly {
                    tracing::error!(
                        ltv = %ltv.round_dp(4),
                        limit = %limit,
                        "EMERGENCY SHUTDOWN: LTV above shutdown limit"
                    );
                }
            }
            manager.check_circuit_breaker(now);

            if !was_halted && self.halt.is_halted() {
                self.publish_snapshot(&manager);
            }
        }
        self.note_halt(was_halted);
        Ok(CycleOutcome::Completed)
    }

    async fn run_expiry_cycle(&self) -> PoolResult<CycleOutcome> {
        let now = Utc::now();
        let mut manager = self.manager.lock().await;
        let expired = manager.expire_policies(now)?;

        let period = chrono::Duration::days(i64::from(manager.config().premium_period_days));
        let roll_due = now - *self.period_started.lock() >= period;
        if roll_due {
            manager.roll_yield_period()?;
            *self.period_started.lock() = now;
        }

        if !expired.is_empty() || roll_due {
            self.publish_snapshot(&manager);
        }
        Ok(CycleOutcome::Completed)
    }
}

async fn run_subsystem(
    state: Arc<DaemonState>,
    subsystem: Subsystem,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = state.interval_for(subsystem);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycle: u64 = 0;

    tracing::info!(
        subsystem = %subsystem,
        interval_ms = interval.as_millis() as u64,
        "Subsystem started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        cycle += 1;
        // Errors are recorded in metrics and logged by run_cycle
        let _ = state.run_cycle(subsystem, cycle).await;
    }

    tracing::info!(subsystem = %subsystem, cycles = cycle, "Subsystem stopped");
}

/// Owns the subsystem tasks until shutdown.
pub struct Orchestrator {
    state: Arc<DaemonState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    events_rx: mpsc::Receiver<PolicyEvent>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        manager: CollateralManager,
        ledger: Arc<dyn Ledger>,
        market: Arc<dyn MarketDataSource>,
    ) -> (Self, DaemonHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.scheduler.event_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let state = Arc::new(DaemonState::new(config, manager, ledger, market));

        let handle = DaemonHandle {
            state: state.clone(),
            events_tx,
            shutdown_tx: shutdown_tx.clone(),
        };
        (
            Self {
                state,
                shutdown_tx,
                events_rx,
            },
            handle,
        )
    }

    /// Run every subsystem and the policy event consumer until `shutdown()`.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            state,
            shutdown_tx,
            events_rx,
        } = self;

        let mut tasks = JoinSet::new();
        for subsystem in Subsystem::ALL {
            tasks.spawn(run_subsystem(
                state.clone(),
                subsystem,
                shutdown_tx.subscribe(),
            ));
        }
        tasks.spawn(EventProcessor::new(state.clone()).run(events_rx, shutdown_tx.subscribe()));

        tracing::info!(subsystems = Subsystem::ALL.len(), "Daemon running");

        let mut aborted = 0;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                aborted += 1;
                tracing::error!(error = %e, "Daemon task aborted");
            }
        }
        if aborted > 0 {
            anyhow::bail!("{} daemon task(s) aborted", aborted);
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }
}

/// Cloneable entry point for callers outside the daemon loops.
#[derive(Clone)]
pub struct DaemonHandle {
    state: Arc<DaemonState>,
    events_tx: mpsc::Sender<PolicyEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DaemonHandle {
    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub async fn submit_policy(&self, policy: Policy) -> PoolResult<CoverageReceipt> {
        self.state.submit_policy(policy).await
    }

    pub async fn approve_claim(
        &self,
        policy_id: Uuid,
        amount: Decimal,
    ) -> PoolResult<PayoutReceipt> {
        self.state.approve_claim(policy_id, amount).await
    }

    pub async fn expire_policy(&self, policy_id: Uuid) -> PoolResult<()> {
        self.state.expire_policy(policy_id).await
    }

    /// Process a policy event inline and return its result.
    pub async fn handle_event(&self, event: PolicyEvent) -> PoolResult<()> {
        EventProcessor::new(self.state.clone())
            .process_event(event)
            .await
    }

    /// Sender for feeding policy events to the daemon's consumer task.
    pub fn event_sender(&self) -> mpsc::Sender<PolicyEvent> {
        self.events_tx.clone()
    }

    pub async fn deposit(&self, tranche_id: &str, amount: Decimal) -> PoolResult<DepositReceipt> {
        self.state.deposit(tranche_id, amount).await
    }

    pub async fn withdraw(
        &self,
        tranche_id: &str,
        token_amount: Decimal,
    ) -> PoolResult<WithdrawReceipt> {
        self.state.withdraw(tranche_id, token_amount).await
    }

    pub fn pool_snapshot(&self) -> Arc<PoolSnapshot> {
        self.state.pool_snapshot()
    }

    pub fn watch_pool(&self) -> watch::Receiver<Arc<PoolSnapshot>> {
        self.state.watch_pool()
    }

    pub fn metrics(&self) -> DaemonMetrics {
        self.state.metrics()
    }

    pub fn last_risk(&self) -> Option<RiskSnapshot> {
        self.state.last_risk()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.state.subscribe()
    }

    pub async fn trigger_halt(&self, reason: impl Into<String>) -> bool {
        self.state.trigger_halt(reason).await
    }

    pub async fn clear_halt(&self) -> Vec<HaltReason> {
        self.state.clear_halt().await
    }

    /// Ask every loop to stop at its next cycle boundary.
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }
}
