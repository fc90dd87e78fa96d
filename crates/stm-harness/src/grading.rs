// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Grading engine: thread lifecycle, repeat loop, timeout escalation
//!
//! [`measure`] drives one workload through its phases with W worker threads:
//! one init phase, K measured repeats (keeping the median), one correctness
//! check. Every phase is gated by the [`PhaseSync`] so all workers start
//! together.
//!
//! The first artifact evaluated is the reference implementation; its phase
//! times, multiplied by the slow factor, become the wall-clock budgets of
//! every following candidate. A candidate exceeding a budget cannot be
//! cancelled (its threads may be parked anywhere inside the artifact), so
//! the engine abandons the workers and the process exits with a dedicated
//! code rather than unloading a library with live threads in it.

use std::sync::Arc;
use std::thread;

use crate::bank::{Balance, BankConfig};
use crate::clock::Tick;
use crate::error::{HarnessError, HarnessResult};
use crate::sync::{PhaseOutcome, PhaseSync};
use crate::workload::{Seed, WorkerId, Workload};

/// Run parameters, fixed at startup and passed down explicitly.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub workers: usize,
    pub tx_per_worker: usize,
    pub accounts: usize,
    pub expected_accounts: usize,
    pub init_balance: Balance,
    pub prob_long: f64,
    pub prob_alloc: f64,
    pub repeats: usize,
    pub slow_factor: u64,
    pub seed: Seed,
}

impl Params {
    /// Derive the run parameters from the hardware parallelism.
    pub fn detect(seed: Seed) -> Self {
        let workers = thread::available_parallelism().map_or(16, |n| n.get());
        Self {
            workers,
            tx_per_worker: 200_000 / workers,
            accounts: 32 * workers,
            expected_accounts: 256 * workers,
            init_balance: 100,
            prob_long: 0.5,
            prob_alloc: 0.01,
            repeats: 7,
            slow_factor: 8,
            seed,
        }
    }

    /// The bank workload configuration these parameters describe.
    pub fn bank_config(&self) -> BankConfig {
        BankConfig {
            workers: self.workers,
            tx_per_worker: self.tx_per_worker,
            accounts: self.accounts,
            expected_accounts: self.expected_accounts,
            init_balance: self.init_balance,
            prob_long: self.prob_long,
            prob_alloc: self.prob_alloc,
        }
    }
}

/// Per-phase wall-clock budgets (`None` while measuring the reference).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseBudgets {
    pub init: Option<Tick>,
    pub perf: Option<Tick>,
    pub check: Option<Tick>,
}

/// Phase timings of one successful evaluation (in ns).
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimes {
    pub init: Tick,
    /// Median of the measured repeats, ties broken by index.
    pub perf: Tick,
    pub check: Tick,
}

impl PhaseBudgets {
    /// Budgets for candidates, derived from the reference timings.
    pub fn from_reference(times: &PhaseTimes, slow_factor: u64) -> Self {
        Self {
            init: Some(slow_factor * times.init),
            perf: Some(slow_factor * times.perf),
            check: Some(slow_factor * times.check),
        }
    }
}

/// Turn a worker's phase result into the synchronizer's error line.
///
/// Correctness violations pass through verbatim; anything else is unexpected
/// inside a phase, gets logged, and is reported generically.
fn report(result: HarnessResult<()>) -> Option<String> {
    match result {
        Ok(()) => None,
        Err(HarnessError::Violation { message }) => Some(message.to_string()),
        Err(err) => {
            tracing::error!("worker failed outside the workload contract: {err}");
            Some("Internal worker exception(s)".to_string())
        }
    }
}

/// Measure one workload with `workers` threads over `repeats` runs.
///
/// The outer error is fatal (spawn failure or a blown phase budget: worker
/// threads were abandoned and the caller must quick-exit). The inner result
/// is the workload verdict: phase timings, or the violation line.
pub fn measure(
    workload: Arc<dyn Workload>,
    workers: usize,
    repeats: usize,
    seed: Seed,
    budgets: PhaseBudgets,
) -> HarnessResult<Result<PhaseTimes, String>> {
    let sync = Arc::new(PhaseSync::new(workers));

    let mut handles = Vec::with_capacity(workers);
    for uid in 0..workers {
        let worker_sync = Arc::clone(&sync);
        let workload = Arc::clone(&workload);
        let spawned = thread::Builder::new()
            .name(format!("worker-{uid}"))
            .spawn(move || worker_loop(&worker_sync, workload.as_ref(), uid, workers, repeats, seed));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // Spawned workers are parked at the gate; release them
                // before reporting the failure.
                sync.master_join();
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(HarnessError::Spawn {
                    reason: err.to_string(),
                });
            }
        }
    }

    // Any `?` below leaves the workers unjoined on purpose: they may be
    // stuck inside the artifact and joining would deadlock.
    let phases = (|| -> HarnessResult<Result<PhaseTimes, String>> {
        tracing::debug!("initialization phase");
        sync.master_notify();
        let init = match sync.master_wait(budgets.init)? {
            PhaseOutcome::Elapsed(ticks) => ticks,
            PhaseOutcome::Failed(message) => return Ok(Err(message)),
        };

        let mut times = Vec::with_capacity(repeats);
        for repeat in 0..repeats {
            tracing::debug!(repeat, "performance phase");
            sync.master_notify();
            match sync.master_wait(budgets.perf)? {
                PhaseOutcome::Elapsed(ticks) => times.push(ticks),
                PhaseOutcome::Failed(message) => return Ok(Err(message)),
            }
        }
        let median_pos = repeats / 2;
        let (_, median, _) = times.select_nth_unstable(median_pos);
        let perf = *median;

        tracing::debug!("correctness check phase");
        sync.master_notify();
        let check = match sync.master_wait(budgets.check)? {
            PhaseOutcome::Elapsed(ticks) => ticks,
            PhaseOutcome::Failed(message) => return Ok(Err(message)),
        };

        Ok(Ok(PhaseTimes { init, perf, check }))
    })()?;

    sync.master_join();
    for handle in handles {
        let _ = handle.join();
    }
    Ok(phases)
}

fn worker_loop(
    sync: &PhaseSync,
    workload: &dyn Workload,
    uid: WorkerId,
    workers: usize,
    repeats: usize,
    seed: Seed,
) {
    // Initialization: worker 0 writes, the others are spectators.
    if !sync.worker_wait() {
        return;
    }
    sync.worker_notify(report(if uid == 0 { workload.init() } else { Ok(()) }));

    // Performance repeats, each with its own deterministic seed.
    for repeat in 0..repeats {
        if !sync.worker_wait() {
            return;
        }
        let phase_seed = seed + (workers as Seed) * (repeat as Seed) + uid as Seed;
        sync.worker_notify(report(workload.run(uid, phase_seed)));
    }

    // Correctness check; a fresh unpredictable seed is wanted here.
    if !sync.worker_wait() {
        return;
    }
    sync.worker_notify(report(workload.check(uid, rand::random())));

    if !sync.worker_wait() {
        return;
    }
    // The master only opens init/run/check phases before joining.
    tracing::error!("worker {uid} woke for a phase past the correctness check");
    sync.worker_notify(Some("Internal worker exception(s)".to_string()));
}
