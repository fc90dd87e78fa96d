// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bank workload: a segmented account list under transactional memory
//!
//! Shared state is a null-terminated list of account segments. Each segment
//! stores its active account count, a pointer to the next segment, a signed
//! parity correction, and an inline array of balances. The parity absorbs
//! the residue of removed accounts so that one global invariant survives any
//! interleaving:
//!
//! ```text
//! Σ balances + Σ parities = init_balance × active accounts
//! ```
//!
//! Workers mix three transaction kinds (a read-only sweep that audits the
//! invariant, an allocate/deallocate transaction that grows or shrinks the
//! list toward a gamma-distributed trigger, and a short two-account
//! transfer) then finish with one last audit. A separate check phase runs a
//! counter-decrement oracle that catches lost updates and stale reads the
//! mixed run may miss.

use std::sync::Arc;

use rand::distributions::{Bernoulli, Distribution, Uniform};
use rand::SeedableRng;
use rand_distr::Gamma;
use rand_pcg::Pcg64Mcg;

use crate::binder::TmLibrary;
use crate::cell::{Shared, SharedPtr, SharedSlice};
use crate::error::{HarnessError, HarnessResult};
use crate::primitives::SpinBarrier;
use crate::region::Region;
use crate::tx::{atomically, Mode, Tx};
use crate::workload::{Seed, WorkerId, Workload};

/// Account balance. Signed and at least pointer-wide so a segment's parity
/// and next-pointer words share the segment alignment.
pub type Balance = isize;

/// Per-worker transaction count of the check phase (independent of the
/// measured run's transaction budget).
const CHECK_TX_PER_WORKER: usize = 100;

/// Field order of a segment header in shared memory.
#[repr(C)]
struct SegmentHeader {
    count: usize,
    next: *mut std::ffi::c_void,
    parity: Balance,
}

/// Segment size in bytes for a given per-segment account capacity.
const fn segment_size(accounts: usize) -> usize {
    std::mem::size_of::<SegmentHeader>() + accounts * std::mem::size_of::<Balance>()
}

/// Segment (and region) alignment in bytes.
const fn segment_align() -> usize {
    std::mem::align_of::<SegmentHeader>()
}

/// Cells over one segment, bound for the current transaction attempt.
struct SegmentView {
    count: Shared<usize>,
    next: SharedPtr<u8>,
    parity: Shared<Balance>,
    accounts: SharedSlice<Balance>,
}

impl SegmentView {
    fn bind(tx: &Tx<'_>, base: *mut u8) -> Self {
        let count = Shared::new(tx, base);
        let next = SharedPtr::new(tx, count.after());
        let parity = Shared::new(tx, next.after());
        let accounts = SharedSlice::new(tx, parity.after());
        Self {
            count,
            next,
            parity,
            accounts,
        }
    }
}

/// Bank workload parameters.
#[derive(Debug, Clone, Copy)]
pub struct BankConfig {
    /// Total number of concurrent workers (for both run and check).
    pub workers: usize,
    /// Number of transactions per worker in one measured run.
    pub tx_per_worker: usize,
    /// Initial number of accounts, and account capacity per segment.
    pub accounts: usize,
    /// Expected total number of accounts (allocation trigger center).
    pub expected_accounts: usize,
    /// Initial account balance.
    pub init_balance: Balance,
    /// Probability of a long read-only audit transaction.
    pub prob_long: f64,
    /// Probability of an allocation transaction, given no audit runs.
    pub prob_alloc: f64,
}

/// The bank workload over one freshly created region.
pub struct Bank {
    config: BankConfig,
    region: Region,
    barrier: SpinBarrier,
    long_dist: Bernoulli,
    alloc_dist: Bernoulli,
    trigger_dist: Gamma<f32>,
}

impl Bank {
    pub fn new(library: Arc<TmLibrary>, config: BankConfig) -> HarnessResult<Self> {
        if config.workers == 0 || config.accounts == 0 {
            return Err(HarnessError::Config {
                reason: "worker and account counts must be non-zero",
            });
        }
        let long_dist = Bernoulli::new(config.prob_long).map_err(|_| HarnessError::Config {
            reason: "long transaction probability outside [0, 1]",
        })?;
        let alloc_dist = Bernoulli::new(config.prob_alloc).map_err(|_| HarnessError::Config {
            reason: "allocation transaction probability outside [0, 1]",
        })?;
        let trigger_dist =
            Gamma::new(config.expected_accounts as f32, 1.0).map_err(|_| HarnessError::Config {
                reason: "expected account count must be positive",
            })?;
        let region = Region::create(library, segment_align(), segment_size(config.accounts))?;
        Ok(Self {
            config,
            region,
            barrier: SpinBarrier::new(config.workers as u32),
            long_dist,
            alloc_dist,
            trigger_dist,
        })
    }

    /// The region this workload runs on (exposed for post-run inspection).
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Long read-only transaction: audit the global balance invariant.
    ///
    /// On success updates `count_estimate`, the caller's loose view of the
    /// total account count. Returns whether the books balanced.
    fn long_tx(&self, count_estimate: &mut usize) -> HarnessResult<bool> {
        let init_balance = self.config.init_balance;
        atomically(&self.region, Mode::ReadOnly, |tx| {
            let mut count = 0usize;
            let mut sum: Balance = 0;
            let mut start = self.region.start();
            while !start.is_null() {
                let segment = SegmentView::bind(tx, start);
                let segment_count = segment.count.read(tx)?;
                count += segment_count;
                sum += segment.parity.read(tx)?;
                for i in 0..segment_count {
                    let balance = segment.accounts.read(tx, i)?;
                    if balance < 0 {
                        return Ok(false);
                    }
                    sum += balance;
                }
                start = segment.next.read(tx)? as *mut u8;
            }
            *count_estimate = count;
            Ok(sum == init_balance * count as Balance)
        })
    }

    /// Account (de)allocation transaction.
    ///
    /// Walks to the tail segment, then shrinks the list if the current total
    /// exceeds `trigger` (and at least three accounts remain) or grows it
    /// otherwise. Removing an account folds its balance minus the initial
    /// balance into the segment parity; removing the last account of the
    /// tail frees the whole segment through the previous segment's pointer.
    fn alloc_tx(&self, trigger: usize) -> HarnessResult<()> {
        let config = self.config;
        atomically(&self.region, Mode::ReadWrite, |tx| {
            let mut count = 0usize;
            let mut prev: *mut u8 = std::ptr::null_mut();
            let mut start = self.region.start();
            loop {
                let segment = SegmentView::bind(tx, start);
                let segment_count = segment.count.read(tx)?;
                count += segment_count;
                let segment_next = segment.next.read(tx)?;
                if segment_next.is_null() {
                    if count > trigger && count > 2 {
                        // Deallocate one account from the tail.
                        let removed = segment.accounts.read(tx, segment_count - 1)?;
                        let new_parity =
                            segment.parity.read(tx)? + removed - config.init_balance;
                        if segment_count - 1 > 0 {
                            segment.count.write(tx, segment_count - 1)?;
                            segment.parity.write(tx, new_parity)?;
                        } else {
                            // Tail emptied: free it and fold its parity into
                            // the previous segment. The first segment always
                            // keeps at least one account at count > 2.
                            debug_assert!(!prev.is_null(), "deallocating the first segment");
                            let prev_segment = SegmentView::bind(tx, prev);
                            prev_segment.next.free(tx)?;
                            let prev_parity = prev_segment.parity.read(tx)?;
                            prev_segment.parity.write(tx, prev_parity + new_parity)?;
                        }
                    } else if segment_count < config.accounts {
                        // Room in the tail: activate one more account.
                        segment.accounts.write(tx, segment_count, config.init_balance)?;
                        segment.count.write(tx, segment_count + 1)?;
                    } else {
                        // Tail full: link a fresh segment. The allocation is
                        // zeroed, so its next pointer and parity need no
                        // explicit initialization.
                        let fresh = segment.next.alloc(tx, segment_size(config.accounts))?;
                        let next_segment = SegmentView::bind(tx, fresh);
                        next_segment.count.write(tx, 1)?;
                        next_segment.accounts.write(tx, 0, config.init_balance)?;
                    }
                    return Ok(());
                }
                prev = start;
                start = segment_next;
            }
        })
    }

    /// Short read-write transaction: transfer one unit between two accounts
    /// (possibly the same one).
    ///
    /// Returns whether the indices named existing accounts and the transfer
    /// committed; `false` asks the caller to redraw indices and try again.
    fn short_tx(&self, send_id: usize, recv_id: usize) -> HarnessResult<bool> {
        atomically(&self.region, Mode::ReadWrite, |tx| {
            // Fresh index copies: a retried attempt must restart the walk
            // with the original indices.
            let mut send_id = send_id;
            let mut recv_id = recv_id;
            let mut send_ptr: *mut Balance = std::ptr::null_mut();
            let mut recv_ptr: *mut Balance = std::ptr::null_mut();
            let mut start = self.region.start();
            loop {
                let segment = SegmentView::bind(tx, start);
                let segment_count = segment.count.read(tx)?;
                if send_ptr.is_null() {
                    if send_id < segment_count {
                        send_ptr = segment.accounts.at(send_id).address();
                        if !recv_ptr.is_null() {
                            break;
                        }
                    } else {
                        send_id -= segment_count;
                    }
                }
                if recv_ptr.is_null() {
                    if recv_id < segment_count {
                        recv_ptr = segment.accounts.at(recv_id).address();
                        if !send_ptr.is_null() {
                            break;
                        }
                    } else {
                        recv_id -= segment_count;
                    }
                }
                start = segment.next.read(tx)? as *mut u8;
                if start.is_null() {
                    // At least one account does not exist: commit a no-op.
                    return Ok(false);
                }
            }
            let sender = Shared::<Balance>::new(tx, send_ptr as *mut u8);
            let recver = Shared::<Balance>::new(tx, recv_ptr as *mut u8);
            let send_val = sender.read(tx)?;
            if send_val > 0 {
                sender.write(tx, send_val - 1)?;
                let recv_val = recver.read(tx)?;
                recver.write(tx, recv_val + 1)?;
            }
            Ok(true)
        })
    }
}

impl Workload for Bank {
    fn init(&self) -> HarnessResult<()> {
        let config = self.config;
        atomically(&self.region, Mode::ReadWrite, |tx| {
            let segment = SegmentView::bind(tx, self.region.start());
            segment.count.write(tx, config.accounts)?;
            for i in 0..config.accounts {
                segment.accounts.write(tx, i, config.init_balance)?;
            }
            Ok(())
        })?;
        // Probe the commit/visibility pipeline before any measurement runs.
        let correct = atomically(&self.region, Mode::ReadOnly, |tx| {
            let segment = SegmentView::bind(tx, self.region.start());
            Ok(segment.accounts.read(tx, 0)? == config.init_balance)
        })?;
        if !correct {
            return Err(HarnessError::Violation {
                message: "Violated consistency (check that committed writes in shared memory \
                          get visible to the following transactions' reads)",
            });
        }
        Ok(())
    }

    fn run(&self, _uid: WorkerId, seed: Seed) -> HarnessResult<()> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut count = self.config.accounts;
        for _ in 0..self.config.tx_per_worker {
            if self.long_dist.sample(&mut rng) {
                if !self.long_tx(&mut count)? {
                    return Err(HarnessError::Violation {
                        message: "Violated isolation or atomicity",
                    });
                }
            } else if self.alloc_dist.sample(&mut rng) {
                let trigger = self.trigger_dist.sample(&mut rng) as usize;
                self.alloc_tx(trigger)?;
            } else {
                let account = Uniform::from(0..count);
                loop {
                    let send_id = account.sample(&mut rng);
                    let recv_id = account.sample(&mut rng);
                    if self.short_tx(send_id, recv_id)? {
                        break;
                    }
                }
            }
        }
        // One last audit after the mixed run.
        let mut ignored = 0;
        if !self.long_tx(&mut ignored)? {
            return Err(HarnessError::Violation {
                message: "Violated isolation or atomicity",
            });
        }
        Ok(())
    }

    fn check(&self, uid: WorkerId, _seed: Seed) -> HarnessResult<()> {
        let workers = self.config.workers;
        self.barrier.sync();
        if uid == 0 {
            let init_counter = CHECK_TX_PER_WORKER * workers;
            atomically(&self.region, Mode::ReadWrite, |tx| {
                Shared::<usize>::new(tx, self.region.start()).write(tx, init_counter)
            })?;
            let correct = atomically(&self.region, Mode::ReadOnly, |tx| {
                Ok(Shared::<usize>::new(tx, self.region.start()).read(tx)? == init_counter)
            })?;
            if !correct {
                // Re-sync twice so the other workers' barrier passages still
                // pair up before this worker bails out.
                self.barrier.sync();
                self.barrier.sync();
                return Err(HarnessError::Violation {
                    message: "Violated consistency",
                });
            }
        }
        self.barrier.sync();
        for _ in 0..CHECK_TX_PER_WORKER {
            // Upper bound sampled in its own read-only transaction: any
            // later read returning more than this has seen a lost update or
            // a stale snapshot.
            let last = atomically(&self.region, Mode::ReadOnly, |tx| {
                Shared::<usize>::new(tx, self.region.start()).read(tx)
            })?;
            let correct = atomically(&self.region, Mode::ReadWrite, |tx| {
                let counter = Shared::<usize>::new(tx, self.region.start());
                let value = counter.read(tx)?;
                if value > last {
                    return Ok(false);
                }
                counter.write(tx, value.wrapping_sub(1))?;
                Ok(true)
            })?;
            if !correct {
                self.barrier.sync();
                return Err(HarnessError::Violation {
                    message: "Violated consistency, isolation or atomicity",
                });
            }
        }
        self.barrier.sync();
        if uid == 0 {
            let correct = atomically(&self.region, Mode::ReadOnly, |tx| {
                Ok(Shared::<usize>::new(tx, self.region.start()).read(tx)? == 0)
            })?;
            if !correct {
                return Err(HarnessError::Violation {
                    message: "Violated consistency",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(config: BankConfig) -> Bank {
        Bank::new(Arc::new(TmLibrary::reference()), config).unwrap()
    }

    fn config(workers: usize) -> BankConfig {
        BankConfig {
            workers,
            tx_per_worker: 100,
            accounts: 4,
            expected_accounts: 8,
            init_balance: 100,
            prob_long: 0.5,
            prob_alloc: 0.01,
        }
    }

    /// Sum of balances and parities over the whole list, plus the total
    /// account count, read outside any worker.
    fn audit(bank: &Bank) -> (Balance, usize) {
        atomically(bank.region(), Mode::ReadOnly, |tx| {
            let mut sum: Balance = 0;
            let mut count = 0usize;
            let mut start = bank.region().start();
            while !start.is_null() {
                let segment = SegmentView::bind(tx, start);
                let segment_count = segment.count.read(tx)?;
                count += segment_count;
                sum += segment.parity.read(tx)?;
                for i in 0..segment_count {
                    let balance = segment.accounts.read(tx, i)?;
                    assert!(balance >= 0, "negative balance");
                    sum += balance;
                }
                start = segment.next.read(tx)? as *mut u8;
            }
            Ok((sum, count))
        })
        .unwrap()
    }

    #[test]
    fn test_segment_layout() {
        // count, next pointer, parity, then the inline balances.
        assert_eq!(segment_size(0), 3 * std::mem::size_of::<usize>());
        assert_eq!(
            segment_size(4),
            3 * std::mem::size_of::<usize>() + 4 * std::mem::size_of::<Balance>()
        );
        assert!(segment_align().is_power_of_two());
        assert_eq!(segment_size(4) % segment_align(), 0);
    }

    #[test]
    fn test_init_writes_initial_balances() {
        let bank = bank(config(1));
        bank.init().unwrap();
        let (sum, count) = audit(&bank);
        assert_eq!(count, 4);
        assert_eq!(sum, 400);
    }

    #[test]
    fn test_single_worker_run_preserves_invariant() {
        let bank = bank(config(1));
        bank.init().unwrap();
        bank.run(0, 42).unwrap();
        let (sum, count) = audit(&bank);
        assert_eq!(sum, 100 * count as Balance);
    }

    #[test]
    fn test_transfer_moves_one_unit() {
        let bank = bank(config(1));
        bank.init().unwrap();
        assert!(bank.short_tx(0, 1).unwrap());
        let values = atomically(bank.region(), Mode::ReadOnly, |tx| {
            let segment = SegmentView::bind(tx, bank.region().start());
            Ok((
                segment.accounts.read(tx, 0)?,
                segment.accounts.read(tx, 1)?,
            ))
        })
        .unwrap();
        assert_eq!(values, (99, 101));
    }

    #[test]
    fn test_transfer_to_self_is_noop() {
        let bank = bank(config(1));
        bank.init().unwrap();
        assert!(bank.short_tx(2, 2).unwrap());
        let (sum, count) = audit(&bank);
        assert_eq!(count, 4);
        assert_eq!(sum, 400);
    }

    #[test]
    fn test_transfer_out_of_range_is_rejected() {
        let bank = bank(config(1));
        bank.init().unwrap();
        assert!(!bank.short_tx(0, 100).unwrap());
        assert!(!bank.short_tx(100, 0).unwrap());
    }

    #[test]
    fn test_alloc_tx_grows_and_links_segments() {
        let bank = bank(config(1));
        bank.init().unwrap();
        // Push far past one segment's capacity (4): forces fresh segments.
        for _ in 0..9 {
            bank.alloc_tx(usize::MAX).unwrap();
        }
        let (sum, count) = audit(&bank);
        assert_eq!(count, 13);
        assert_eq!(sum, 100 * 13);
    }

    #[test]
    fn test_alloc_tx_shrinks_back_to_two() {
        let bank = bank(config(1));
        bank.init().unwrap();
        for _ in 0..6 {
            bank.alloc_tx(usize::MAX).unwrap();
        }
        // Trigger 0 deallocates while more than two accounts remain,
        // unlinking emptied tail segments along the way.
        for _ in 0..20 {
            bank.alloc_tx(0).unwrap();
        }
        let (sum, count) = audit(&bank);
        assert_eq!(count, 2);
        assert_eq!(sum, 100 * 2);
    }

    #[test]
    fn test_parity_absorbs_removed_balance() {
        let bank = bank(config(1));
        bank.init().unwrap();
        // Shift one unit so the removed tail account is not at the initial
        // balance, then deallocate it: parity must absorb the difference.
        assert!(bank.short_tx(3, 0).unwrap());
        bank.alloc_tx(0).unwrap();
        let (sum, count) = audit(&bank);
        assert_eq!(count, 3);
        assert_eq!(sum, 100 * 3);
    }

    #[test]
    fn test_check_single_worker_counts_down_to_zero() {
        let bank = bank(config(1));
        bank.init().unwrap();
        bank.check(0, 0).unwrap();
        let counter = atomically(bank.region(), Mode::ReadOnly, |tx| {
            Shared::<usize>::new(tx, bank.region().start()).read(tx)
        })
        .unwrap();
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_run_rejects_corrupted_books() {
        let bank = bank(config(1));
        bank.init().unwrap();
        // Corrupt one balance outside the audit's knowledge.
        atomically(bank.region(), Mode::ReadWrite, |tx| {
            let segment = SegmentView::bind(tx, bank.region().start());
            segment.accounts.write(tx, 0, 1)
        })
        .unwrap();
        let mut count = 0;
        assert!(!bank.long_tx(&mut count).unwrap());
    }
}
