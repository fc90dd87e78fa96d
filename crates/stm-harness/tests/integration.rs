//! End-to-end scenarios over the built-in reference implementation
//!
//! These drive the real workload and grading engine in-process, the way the
//! CLI does after loading artifacts from disk. The account-list layout used
//! by the audit helper mirrors the bank workload: count word, next pointer,
//! parity, then the inline balances.

use std::sync::Arc;
use std::thread;

use stm_harness::cell::{Shared, SharedPtr, SharedSlice};
use stm_harness::grading::PhaseBudgets;
use stm_harness::{atomically, measure, Bank, BankConfig, Mode, Region, TmLibrary, Workload};

type Balance = isize;

fn bank(config: BankConfig) -> Arc<Bank> {
    Arc::new(Bank::new(Arc::new(TmLibrary::reference()), config).unwrap())
}

/// Walk the whole segment list outside any worker: returns the balance sum
/// (parities included) and the active account count, asserting no balance
/// is negative.
fn audit(region: &Region) -> (Balance, usize) {
    atomically(region, Mode::ReadOnly, |tx| {
        let mut sum: Balance = 0;
        let mut count = 0usize;
        let mut start = region.start();
        while !start.is_null() {
            let count_cell = Shared::<usize>::new(tx, start);
            let next_cell = SharedPtr::<u8>::new(tx, count_cell.after());
            let parity_cell = Shared::<Balance>::new(tx, next_cell.after());
            let accounts = SharedSlice::<Balance>::new(tx, parity_cell.after());

            let segment_count = count_cell.read(tx)?;
            count += segment_count;
            sum += parity_cell.read(tx)?;
            for i in 0..segment_count {
                let balance = accounts.read(tx, i)?;
                assert!(balance >= 0, "negative balance observed");
                sum += balance;
            }
            start = next_cell.read(tx)?;
        }
        Ok((sum, count))
    })
    .unwrap()
}

/// Run the measured phase by hand (init + one run per worker, no check
/// phase) so the shared state stays auditable afterwards.
fn run_once(bank: &Bank, workers: usize, seed: u64) {
    bank.init().unwrap();
    thread::scope(|scope| {
        for uid in 0..workers {
            let seed = seed + uid as u64;
            scope.spawn(move || bank.run(uid, seed).unwrap());
        }
    });
}

#[test]
fn test_single_thread_sanity() {
    let bank = bank(BankConfig {
        workers: 1,
        tx_per_worker: 100,
        accounts: 4,
        expected_accounts: 8,
        init_balance: 100,
        prob_long: 0.5,
        prob_alloc: 0.0,
    });
    run_once(&bank, 1, 7);
    let (sum, count) = audit(bank.region());
    assert_eq!(count, 4);
    assert_eq!(sum, 400);
}

#[test]
fn test_pure_read_contention() {
    let bank = bank(BankConfig {
        workers: 4,
        tx_per_worker: 200,
        accounts: 16,
        expected_accounts: 16,
        init_balance: 100,
        prob_long: 1.0,
        prob_alloc: 0.0,
    });
    run_once(&bank, 4, 99);
    // Nothing but audits ran: no allocation, no transfer.
    let (sum, count) = audit(bank.region());
    assert_eq!(count, 16);
    assert_eq!(sum, 1600);
}

#[test]
fn test_alloc_churn() {
    let bank = bank(BankConfig {
        workers: 2,
        tx_per_worker: 20,
        accounts: 3,
        expected_accounts: 8,
        init_balance: 100,
        prob_long: 0.0,
        prob_alloc: 1.0,
    });
    run_once(&bank, 2, 3);
    let (sum, count) = audit(bank.region());
    // The gamma-driven churn keeps the count near its target; the books
    // must balance exactly regardless of where it landed.
    assert!(count >= 3 && count <= 64, "count {count} out of range");
    assert_eq!(sum, 100 * count as Balance);
}

#[test]
fn test_transfer_cycle() {
    let bank = bank(BankConfig {
        workers: 4,
        tx_per_worker: 1000,
        accounts: 4,
        expected_accounts: 8,
        init_balance: 1,
        prob_long: 0.0,
        prob_alloc: 0.0,
    });
    run_once(&bank, 4, 21);
    let (sum, count) = audit(bank.region());
    assert_eq!(count, 4);
    assert_eq!(sum, 4);
}

#[test]
fn test_check_phase_decrements_to_zero() {
    let workers = 4;
    let bank = bank(BankConfig {
        workers,
        tx_per_worker: 10,
        accounts: 4,
        expected_accounts: 8,
        init_balance: 100,
        prob_long: 0.5,
        prob_alloc: 0.01,
    });
    bank.init().unwrap();
    thread::scope(|scope| {
        for uid in 0..workers {
            let bank = &bank;
            scope.spawn(move || bank.check(uid, 0).unwrap());
        }
    });
    // Worker 0 verified the zero endpoint inside check; confirm from here.
    let counter = atomically(bank.region(), Mode::ReadOnly, |tx| {
        Shared::<usize>::new(tx, bank.region().start()).read(tx)
    })
    .unwrap();
    assert_eq!(counter, 0);
}

#[test]
fn test_full_measure_pipeline() {
    let bank = bank(BankConfig {
        workers: 2,
        tx_per_worker: 50,
        accounts: 8,
        expected_accounts: 16,
        init_balance: 100,
        prob_long: 0.5,
        prob_alloc: 0.01,
    });
    let times = measure(
        Arc::clone(&bank) as Arc<dyn Workload>,
        2,
        3,
        42,
        PhaseBudgets::default(),
    )
    .unwrap()
    .unwrap();
    assert!(times.init > 0);
    assert!(times.perf > 0);
    assert!(times.check > 0);
}

#[test]
fn test_candidate_budgets_allow_equal_candidate() {
    // Grade the reference against budgets derived from its own timings: a
    // candidate as fast as the reference must never be rejected. The slow
    // factor is widened here because the phases are tiny and scheduler
    // jitter dominates them.
    let config = BankConfig {
        workers: 2,
        tx_per_worker: 50,
        accounts: 8,
        expected_accounts: 16,
        init_balance: 100,
        prob_long: 0.5,
        prob_alloc: 0.01,
    };
    let reference = bank(config);
    let times = measure(
        Arc::clone(&reference) as Arc<dyn Workload>,
        2,
        3,
        42,
        PhaseBudgets::default(),
    )
    .unwrap()
    .unwrap();

    let candidate = bank(config);
    let verdict = measure(
        Arc::clone(&candidate) as Arc<dyn Workload>,
        2,
        3,
        42,
        PhaseBudgets::from_reference(&times, 64),
    )
    .unwrap();
    assert!(verdict.is_ok());
}
