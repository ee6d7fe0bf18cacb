//! Waterfall integration tests for the collateral manager.
//!
//! Amounts in the scenario tests are in $M.

use chrono::{Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use tranche_collateral::curve::BondingCurve;
use tranche_collateral::ledger::{
    InMemoryLedger, LedgerReceipt, MutationState, RetryPolicy, submit_with_retry,
};
use tranche_collateral::{CapitalPool, CollateralManager, TrancheSpec};
use tranche_common::config::CollateralConfig;
use tranche_common::error::PoolError;
use tranche_common::halt::{HaltFlag, HaltReason};
use tranche_common::types::{Policy, PolicyStatus};

// ============================================================
// Shared helpers
// ============================================================

/// BTC=13, SNR=12, MEZZ=13, JNR=12, JNR+=12, EQT=10 (total 72).
fn reference_manager() -> CollateralManager {
    let specs = TrancheSpec::default_layout([
        dec!(13),
        dec!(12),
        dec!(13),
        dec!(12),
        dec!(12),
        dec!(10),
    ]);
    let pool = CapitalPool::new(specs, dec!(72), Decimal::ZERO, Decimal::ZERO).unwrap();
    CollateralManager::new(pool, CollateralConfig::default(), HaltFlag::new())
}

fn make_policy(coverage: Decimal) -> Policy {
    let now = Utc::now();
    Policy {
        policy_id: Uuid::new_v4(),
        policyholder: "0xholder".to_string(),
        insured_asset: "ETH".to_string(),
        coverage_amount: coverage,
        premium_paid: Decimal::ZERO,
        trigger_price: dec!(2000),
        floor_price: dec!(1200),
        start_time: now,
        expiry_time: now + Duration::days(90),
        status: PolicyStatus::Active,
        payout_amount: None,
        payout_time: None,
    }
}

fn capitals(m: &CollateralManager) -> Vec<(String, Decimal)> {
    m.pool()
        .virtual_tranches
        .iter()
        .map(|t| (t.tranche_id.clone(), t.allocated_capital))
        .collect()
}

fn capital_of(m: &CollateralManager, id: &str) -> Decimal {
    m.pool().tranche(id).unwrap().allocated_capital
}

fn claim(m: &mut CollateralManager, loss: Decimal) -> Result<(), PoolError> {
    let policy = make_policy(loss);
    let id = policy.policy_id;
    m.allocate_coverage(policy, Utc::now())?;
    m.execute_payout(id, loss, Utc::now()).map(|_| ())
}

// ============================================================
// Loss waterfall
// ============================================================

#[test]
fn test_15m_loss_hits_equity_then_jnr_plus() {
    let mut m = reference_manager();
    claim(&mut m, dec!(15)).unwrap();

    assert_eq!(capital_of(&m, "EQT"), dec!(0));
    assert_eq!(capital_of(&m, "JNR+"), dec!(7));
    assert_eq!(capital_of(&m, "JNR"), dec!(12));
    assert_eq!(capital_of(&m, "MEZZ"), dec!(13));
    assert_eq!(capital_of(&m, "SNR"), dec!(12));
    assert_eq!(capital_of(&m, "BTC"), dec!(13));
    assert_eq!(m.pool().total_capital_usd, dec!(57));
    assert!(!m.halt_flag().is_halted());
}

#[test]
fn test_27m_loss_reaches_jnr() {
    let mut m = reference_manager();
    claim(&mut m, dec!(27)).unwrap();

    assert_eq!(capital_of(&m, "EQT"), dec!(0));
    assert_eq!(capital_of(&m, "JNR+"), dec!(0));
    assert_eq!(capital_of(&m, "JNR"), dec!(7));
    assert_eq!(capital_of(&m, "MEZZ"), dec!(13));
    assert_eq!(capital_of(&m, "SNR"), dec!(12));
    assert_eq!(capital_of(&m, "BTC"), dec!(13));
    assert_eq!(m.pool().tranche("EQT").unwrap().accumulated_losses, dec!(10));
    assert_eq!(m.pool().tranche("JNR+").unwrap().accumulated_losses, dec!(12));
    assert_eq!(m.pool().tranche("JNR").unwrap().accumulated_losses, dec!(5));
}

#[test]
fn test_loss_beyond_capital_is_insolvent() {
    let specs = TrancheSpec::default_layout([
        dec!(20),
        dec!(20),
        dec!(20),
        dec!(15),
        dec!(15),
        dec!(10),
    ]);
    let pool = CapitalPool::new(specs, dec!(100), Decimal::ZERO, Decimal::ZERO).unwrap();
    let config = CollateralConfig {
        max_ltv: dec!(2),
        ..CollateralConfig::default()
    };
    let mut m = CollateralManager::new(pool, config, HaltFlag::new());

    let result = claim(&mut m, dec!(120));
    match result {
        Err(PoolError::Insolvent { loss, available }) => {
            assert_eq!(loss, dec!(120));
            assert_eq!(available, dec!(100));
        }
        other => panic!("expected Insolvent, got {:?}", other),
    }

    for (id, capital) in capitals(&m) {
        assert_eq!(capital, Decimal::ZERO, "tranche {} not drained", id);
    }
    assert_eq!(m.pool().total_capital_usd, Decimal::ZERO);
    assert!(m.pool().check_invariants().is_ok());
    assert!(m.halt_flag().is_halted());
    assert!(matches!(
        m.halt_flag().reasons()[0],
        HaltReason::Insolvent { .. }
    ));

    // New coverage is refused once halted
    let refused = m.allocate_coverage(make_policy(dec!(1)), Utc::now());
    assert!(matches!(refused, Err(PoolError::EmergencyShutdown(_))));
}

#[test]
fn test_payouts_still_process_while_halted() {
    let mut m = reference_manager();
    let policy = make_policy(dec!(5));
    let id = policy.policy_id;
    m.allocate_coverage(policy, Utc::now()).unwrap();

    m.halt_flag().trigger(HaltReason::Manual {
        reason: "drill".to_string(),
    });
    assert!(m.execute_payout(id, dec!(5), Utc::now()).is_ok());
    assert_eq!(capital_of(&m, "EQT"), dec!(5));
}

// ============================================================
// Premium waterfall
// ============================================================

#[test]
fn test_premium_excess_accrues_to_junior() {
    let specs = vec![
        TrancheSpec::new("SNR", 1, BondingCurve::Flat { apy_bps: dec!(200) }, dec!(100)),
        TrancheSpec::new("MEZZ", 2, BondingCurve::Flat { apy_bps: dec!(300) }, dec!(100)),
        TrancheSpec::new("JNR", 3, BondingCurve::Flat { apy_bps: dec!(400) }, dec!(50)),
    ];
    let pool = CapitalPool::new(specs, dec!(250), Decimal::ZERO, Decimal::ZERO).unwrap();
    let config = CollateralConfig {
        premium_period_days: 365,
        ..CollateralConfig::default()
    };
    let mut m = CollateralManager::new(pool, config, HaltFlag::new());

    // Remaining targets: 2 + 3 + 2 = 7
    let allocation = m.distribute_premium(dec!(10), Utc::now()).unwrap();

    assert_eq!(allocation.distributed(), dec!(10));
    assert_eq!(allocation.excess_to_junior, dec!(3));
    assert_eq!(capital_of(&m, "SNR"), dec!(102));
    assert_eq!(capital_of(&m, "MEZZ"), dec!(103));
    assert_eq!(capital_of(&m, "JNR"), dec!(55));
    assert_eq!(m.pool().tranche("JNR").unwrap().accumulated_yields, dec!(5));

    // Targets are met for the period; a second premium goes entirely to the junior
    let second = m.distribute_premium(dec!(1), Utc::now()).unwrap();
    assert_eq!(second.excess_to_junior, dec!(1));

    // After a roll, senior tranches are paid first again
    m.roll_yield_period().unwrap();
    let third = m.distribute_premium(dec!(1), Utc::now()).unwrap();
    assert_eq!(third.shares[0].tranche_id, "SNR");
    assert_eq!(third.shares[0].amount, dec!(1));
}

#[test]
fn test_premium_on_allocation_credits_reserves() {
    let mut m = reference_manager();
    let mut policy = make_policy(dec!(10));
    policy.premium_paid = dec!(0.5);
    let receipt = m.allocate_coverage(policy, Utc::now()).unwrap();

    assert_eq!(receipt.premium.unwrap().distributed(), dec!(0.5));
    assert_eq!(m.pool().usd_reserves, dec!(72.5));
    assert_eq!(m.pool().total_capital_usd, dec!(72.5));
}

// ============================================================
// Snapshots and versions
// ============================================================

#[test]
fn test_snapshot_is_read_only_and_repeatable() {
    let mut m = reference_manager();
    claim(&mut m, dec!(3)).unwrap();
    let version = m.version();
    let now = Utc::now();

    let a = m.snapshot(now);
    let b = m.snapshot(now);
    assert_eq!(a, b);
    assert_eq!(m.version(), version);
    assert_eq!(a.version, version);
}

#[test]
fn test_every_mutation_bumps_version() {
    let mut m = reference_manager();
    let start = m.version();
    m.distribute_premium(dec!(1), Utc::now()).unwrap();
    m.deposit("SNR", dec!(1), Utc::now()).unwrap();
    m.roll_yield_period().unwrap();
    assert_eq!(m.version(), start + 3);

    // Rejected operations leave the version alone
    let _ = m.allocate_coverage(make_policy(dec!(1000)), Utc::now());
    assert_eq!(m.version(), start + 3);
}

// ============================================================
// Ledger settlement
// ============================================================

#[tokio::test]
async fn test_payout_settles_after_transient_failures() {
    let mut m = reference_manager();
    let policy = make_policy(dec!(4));
    let id = policy.policy_id;
    m.allocate_coverage(policy, Utc::now()).unwrap();
    let receipt = m.execute_payout(id, dec!(4), Utc::now()).unwrap();

    let ledger = InMemoryLedger::new();
    ledger.fail_next(3);
    let retry = RetryPolicy {
        max_attempts: 5,
        base_delay: std::time::Duration::from_millis(1),
    };
    let result = submit_with_retry(&ledger, &receipt.op, retry).await;
    assert_eq!(result, Ok(LedgerReceipt::Recorded));

    let confirmed = m.confirm(receipt.mutation_id).unwrap();
    assert_eq!(confirmed.state, MutationState::Confirmed);
    assert_eq!(ledger.payouts(), vec![(id, dec!(4))]);
    assert_eq!(m.pending_count(), 0);
    assert_eq!(m.policy(id).unwrap().status, PolicyStatus::Claimed);
}

#[tokio::test]
async fn test_rejected_deposit_rolls_back() {
    let mut m = reference_manager();
    let before = capitals(&m);
    let receipt = m.deposit("MEZZ", dec!(5), Utc::now()).unwrap();
    assert_eq!(capital_of(&m, "MEZZ"), dec!(18));

    let ledger = InMemoryLedger::new();
    ledger.set_rejecting(true);
    let retry = RetryPolicy::from_config(m.config());
    assert!(submit_with_retry(&ledger, &receipt.op, retry).await.is_err());

    m.rollback(receipt.mutation_id, Utc::now()).unwrap();
    assert_eq!(capitals(&m), before);
    assert_eq!(m.pool().tranche("MEZZ").unwrap().lp_token_supply, dec!(13));
    assert_eq!(m.pool().usd_reserves, dec!(72));
}

#[test]
fn test_rolled_back_loss_leaves_breaker_window() {
    let mut m = reference_manager();
    let policy = make_policy(dec!(15));
    let id = policy.policy_id;
    m.allocate_coverage(policy, Utc::now()).unwrap();
    let receipt = m.execute_payout(id, dec!(15), Utc::now()).unwrap();
    m.rollback(receipt.mutation_id, Utc::now()).unwrap();

    // 15 rolled back + 15 more would trip at 30/72 if the first were still counted
    let second = make_policy(dec!(15));
    let second_id = second.policy_id;
    m.allocate_coverage(second, Utc::now()).unwrap();
    m.execute_payout(second_id, dec!(15), Utc::now()).unwrap();
    assert!(!m.halt_flag().is_halted());
}

// ============================================================
// Properties
// ============================================================

#[derive(Debug, Clone)]
enum Op {
    Premium(u32),
    Loss(u32),
    Deposit(usize, u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..5_000).prop_map(Op::Premium),
        (1u32..40_000).prop_map(Op::Loss),
        (0usize..6, 1u32..10_000).prop_map(|(i, amount)| Op::Deposit(i, amount)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_capital_conserved_and_never_negative(
        ops in proptest::collection::vec(op_strategy(), 1..40)
    ) {
        let specs = TrancheSpec::default_layout([
            dec!(13000), dec!(12000), dec!(13000), dec!(12000), dec!(12000), dec!(10000),
        ]);
        let ids: Vec<String> = specs.iter().map(|s| s.tranche_id.clone()).collect();
        let pool = CapitalPool::new(specs, dec!(72000), Decimal::ZERO, Decimal::ZERO).unwrap();
        let config = CollateralConfig {
            max_ltv: dec!(1000),
            circuit_breaker_loss_pct: Decimal::ONE,
            ..CollateralConfig::default()
        };
        let mut m = CollateralManager::new(pool, config, HaltFlag::new());
        let mut expected = m.pool().total_capital_usd;

        for op in ops {
            match op {
                Op::Premium(amount) => {
                    let amount = Decimal::from(amount);
                    let allocation = m.distribute_premium(amount, Utc::now()).unwrap();
                    prop_assert_eq!(allocation.distributed(), amount);
                    expected += amount;
                }
                Op::Loss(amount) => {
                    let amount = Decimal::from(amount);
                    let policy = make_policy(amount);
                    let id = policy.policy_id;
                    if m.allocate_coverage(policy, Utc::now()).is_err() {
                        continue;
                    }
                    let before = m.pool().total_capital_usd;
                    match m.execute_payout(id, amount, Utc::now()) {
                        Ok(receipt) => {
                            prop_assert_eq!(receipt.allocation.absorbed, amount);
                            // Every tranche hit before the last one was drained
                            let shares = &receipt.allocation.shares;
                            for share in shares.iter().take(shares.len().saturating_sub(1)) {
                                prop_assert_eq!(
                                    m.pool().tranche(&share.tranche_id).unwrap().allocated_capital,
                                    Decimal::ZERO
                                );
                            }
                            expected -= amount;
                            m.confirm(receipt.mutation_id).unwrap();
                        }
                        Err(PoolError::Insolvent { available, .. }) => {
                            prop_assert_eq!(available, before);
                            expected = Decimal::ZERO;
                            if let Some((mutation_id, _)) = m.pending_for_policy(id) {
                                m.confirm(mutation_id).unwrap();
                            }
                        }
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                Op::Deposit(index, amount) => {
                    let amount = Decimal::from(amount);
                    m.deposit(&ids[index], amount, Utc::now()).unwrap();
                    expected += amount;
                }
            }

            prop_assert!(m.pool().check_invariants().is_ok());
            prop_assert_eq!(m.pool().total_capital_usd, expected);
            for tranche in &m.pool().virtual_tranches {
                prop_assert!(tranche.allocated_capital >= Decimal::ZERO);
                prop_assert!(tranche.lp_token_supply >= Decimal::ZERO);
            }
        }
    }
}
