// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Master/worker phase synchronizer
//!
//! Coordinates one master thread with W workers across repeated phases so
//! that all workers start a phase as close together as possible (maximum
//! interference) and the master learns the phase outcome plus its wall-clock
//! time.
//!
//! Status machine, held in one atomic:
//!
//! ```text
//! Done/Fail --master_notify--> Wait --last worker gate--> Run
//! Run --worker_notify(err)--> Abort
//! Run/Abort --last worker_notify--> Done/Fail (latch raised)
//! any --master_join--> Quit (workers exit at their next wait)
//! ```
//!
//! Ordering: the Wait→Run switch is a release store matched by acquire loads
//! in the spinning workers, so anything the last gated worker wrote is
//! visible past the gate; the ready counter's acq-rel increment in `notify`
//! orders error publication before the Fail transition.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::clock::{Chrono, Tick};
use crate::error::{HarnessError, HarnessResult};
use crate::primitives::{short_pause, Latch};

const STATUS_WAIT: u8 = 0; // workers waiting on each other, run as soon as all ready
const STATUS_RUN: u8 = 1; // phase in progress, no failure yet
const STATUS_ABORT: u8 = 2; // phase in progress, at least one failure
const STATUS_DONE: u8 = 3; // phase over, all workers succeeded
const STATUS_FAIL: u8 = 4; // phase over, at least one worker failed
const STATUS_QUIT: u8 = 5; // workers must terminate

/// Outcome of one phase, as observed by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// All workers succeeded; wall-clock time of the phase in ns.
    Elapsed(Tick),
    /// At least one worker failed; one of the reported error lines.
    Failed(String),
}

/// Phase synchronizer for one master and `workers` worker threads.
pub struct PhaseSync {
    workers: u32,
    ready: AtomicU32,
    status: AtomicU8,
    error: Mutex<Option<String>>,
    runtime: Mutex<Chrono>,
    done: Latch,
}

impl PhaseSync {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers as u32,
            ready: AtomicU32::new(0),
            status: AtomicU8::new(STATUS_DONE),
            error: Mutex::new(None),
            runtime: Mutex::new(Chrono::new()),
            done: Latch::new(),
        }
    }

    /// Master: open the next phase and start its clock.
    pub fn master_notify(&self) {
        self.status.store(STATUS_WAIT, Ordering::Relaxed);
        let mut runtime = self.runtime.lock();
        runtime.reset();
        runtime.start();
    }

    /// Master: tell workers to terminate instead of opening a phase.
    pub fn master_join(&self) {
        self.status.store(STATUS_QUIT, Ordering::Relaxed);
    }

    /// Master: wait for all workers to finish the open phase.
    ///
    /// `budget` bounds the wait (`None` for unbounded). Exceeding it means
    /// the artifact under evaluation is stuck or far too slow; the caller
    /// must treat the workers as lost and never unload the artifact.
    pub fn master_wait(&self, budget: Option<Tick>) -> HarnessResult<PhaseOutcome> {
        if !self.done.wait(budget) {
            return Err(HarnessError::Overrun {
                message: "Transactional library takes too long to process the transactions",
            });
        }
        match self.status.load(Ordering::Relaxed) {
            STATUS_DONE => Ok(PhaseOutcome::Elapsed(self.runtime.lock().total())),
            STATUS_FAIL => {
                let message = self.error.lock().take().unwrap_or_default();
                Ok(PhaseOutcome::Failed(message))
            }
            _ => Err(HarnessError::Unreachable {
                context: "master woke after raised latch with the phase still open",
            }),
        }
    }

    /// Worker: spin until the master opens the next phase.
    ///
    /// Returns `false` if the master asked workers to quit. Otherwise all
    /// workers leave this call together: the last one through flips the
    /// status to Run, the others spin until they observe it.
    pub fn worker_wait(&self) -> bool {
        loop {
            match self.status.load(Ordering::Relaxed) {
                STATUS_WAIT => break,
                STATUS_QUIT => return false,
                _ => short_pause(),
            }
        }
        if self.ready.fetch_add(1, Ordering::Relaxed) + 1 == self.workers {
            self.ready.store(0, Ordering::Relaxed);
            // Synchronizes-with the acquire loads of the other workers.
            self.status.store(STATUS_RUN, Ordering::Release);
        } else {
            loop {
                short_pause();
                let status = self.status.load(Ordering::Acquire);
                if status == STATUS_RUN || status == STATUS_ABORT {
                    break;
                }
            }
        }
        true
    }

    /// Worker: report the end of its run for this phase.
    ///
    /// The last worker to report closes the phase: stops the clock, settles
    /// Done/Fail, and raises the master's latch.
    pub fn worker_notify(&self, error: Option<String>) {
        if let Some(message) = error {
            *self.error.lock() = Some(message);
            self.status.store(STATUS_ABORT, Ordering::Relaxed);
        }
        // Acq-rel: a worker that turns out to be last observes any Abort
        // store published before an earlier worker's increment.
        if self.ready.fetch_add(1, Ordering::AcqRel) + 1 == self.workers {
            self.ready.store(0, Ordering::Relaxed);
            let failed = self.status.load(Ordering::Relaxed) == STATUS_ABORT;
            self.status.store(
                if failed { STATUS_FAIL } else { STATUS_DONE },
                Ordering::Relaxed,
            );
            self.runtime.lock().stop();
            self.done.raise();
        }
    }
}
