// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Small synchronization building blocks
//!
//! A one-shot [`Latch`], a reusable [`SpinBarrier`], and [`bounded_run`],
//! which executes a closure on a throwaway thread under a wall-clock budget.
//! The phase synchronizer and the grading engine are built out of these.

use std::sync::atomic::{AtomicU32, AtomicU8};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::Tick;
use crate::error::{HarnessError, HarnessResult};

/// Pause execution for a very short period of time.
#[inline]
pub fn short_pause() {
    thread::yield_now();
}

/// One-shot gate between a group of raisers and one waiter.
///
/// A successful wait resets the latch so the same instance can gate the next
/// phase. The mutex hand-off makes every write that preceded `raise` visible
/// to the thread that returns from `wait`.
pub struct Latch {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Raise the latch. No-op if already raised.
    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.cv.notify_all();
    }

    /// Wait for the latch to be raised, then reset it.
    ///
    /// `budget` is a maximal number of ticks (ns) to wait, `None` for no
    /// limit. Returns whether the latch was raised in time.
    pub fn wait(&self, budget: Option<Tick>) -> bool {
        let mut raised = self.raised.lock();
        match budget {
            None => {
                self.cv.wait_while(&mut raised, |raised| !*raised);
            }
            Some(budget) => {
                let result = self.cv.wait_while_for(
                    &mut raised,
                    |raised| !*raised,
                    Duration::from_nanos(budget),
                );
                // A raise landing exactly at the deadline still counts.
                if result.timed_out() && !*raised {
                    return false;
                }
            }
        }
        *raised = false;
        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Reusable spin barrier.
///
/// Two-phase (enter then leave) so that back-to-back `sync` calls from the
/// same group cannot lap each other within a phase.
pub struct SpinBarrier {
    cardinal: u32,
    step: AtomicU32,
    mode: AtomicU8,
}

const MODE_ENTER: u8 = 0;
const MODE_LEAVE: u8 = 1;

impl SpinBarrier {
    /// `cardinal` is the non-zero number of threads that synchronize.
    pub fn new(cardinal: u32) -> Self {
        debug_assert!(cardinal > 0);
        Self {
            cardinal,
            step: AtomicU32::new(0),
            mode: AtomicU8::new(MODE_ENTER),
        }
    }

    /// Synchronize all the threads.
    pub fn sync(&self) {
        use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

        // Enter
        if self.step.fetch_add(1, Relaxed) + 1 == self.cardinal {
            self.mode.store(MODE_LEAVE, Release);
        } else {
            while self.mode.load(Acquire) != MODE_LEAVE {
                short_pause();
            }
        }
        // Leave
        if self.step.fetch_sub(1, Relaxed) - 1 == 0 {
            self.mode.store(MODE_ENTER, Release);
        } else {
            while self.mode.load(Acquire) != MODE_ENTER {
                short_pause();
            }
        }
    }
}

/// Run `func` on a throwaway thread for at most `budget`.
///
/// On overrun the runner thread is detached (it may be stuck inside an
/// artifact that cannot be cancelled) and `message` is reported as an
/// [`HarnessError::Overrun`]; callers on teardown paths escalate that to a
/// process exit instead of unloading the artifact under the runner's feet.
pub fn bounded_run<T, F>(budget: Duration, message: &'static str, func: F) -> HarnessResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let runner = thread::Builder::new()
        .name("side-runner".into())
        .spawn(move || {
            let _ = sender.send(func());
        })
        .map_err(|err| HarnessError::Spawn {
            reason: err.to_string(),
        })?;
    match receiver.recv_timeout(budget) {
        Ok(value) => {
            let _ = runner.join();
            Ok(value)
        }
        Err(RecvTimeoutError::Timeout) => {
            drop(runner);
            Err(HarnessError::Overrun { message })
        }
        Err(RecvTimeoutError::Disconnected) => {
            // The closure panicked; surface the panic on this thread.
            match runner.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(()) => Err(HarnessError::Unreachable {
                    context: "side runner exited without sending a result",
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_latch_raise_before_wait() {
        let latch = Latch::new();
        latch.raise();
        assert!(latch.wait(None));
        // Reset by the successful wait.
        assert!(!latch.wait(Some(1_000_000)));
    }

    #[test]
    fn test_latch_cross_thread() {
        let latch = Arc::new(Latch::new());
        let raiser = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                latch.raise();
            })
        };
        assert!(latch.wait(None));
        raiser.join().unwrap();
    }

    #[test]
    fn test_latch_timeout() {
        let latch = Latch::new();
        assert!(!latch.wait(Some(5_000_000)));
    }

    #[test]
    fn test_spin_barrier_back_to_back() {
        const THREADS: u32 = 4;
        const ROUNDS: usize = 50;

        let barrier = Arc::new(SpinBarrier::new(THREADS));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::Relaxed);
                        barrier.sync();
                        // Everyone incremented before anyone proceeds.
                        assert_eq!(
                            counter.load(Ordering::Relaxed),
                            (round as u32 + 1) * THREADS
                        );
                        barrier.sync();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_bounded_run_returns_value() {
        let value = bounded_run(Duration::from_secs(1), "too slow", || 21 * 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_bounded_run_overrun() {
        let result: HarnessResult<()> = bounded_run(Duration::from_millis(20), "too slow", || {
            thread::sleep(Duration::from_secs(5));
        });
        match result {
            Err(HarnessError::Overrun { message }) => assert_eq!(message, "too slow"),
            other => panic!("expected overrun, got {other:?}"),
        }
    }
}
