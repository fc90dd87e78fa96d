//! Workload interface driven by the grading engine

use crate::error::HarnessResult;

/// Worker unique id, between 0 and the worker count (exclusive).
pub type WorkerId = usize;

/// Seed for a worker's per-phase PRNG.
pub type Seed = u64;

/// A workload the grading engine can drive through its three phases.
///
/// `run` and `check` are called concurrently from every worker; `init` is
/// called once, by worker 0, before the first measured phase. Correctness
/// violations are reported as [`crate::HarnessError::Violation`], whose
/// message becomes the single line shown to the user.
pub trait Workload: Send + Sync {
    /// Shared memory (re)initialization, with a cheap visibility probe.
    fn init(&self) -> HarnessResult<()>;

    /// One worker's full measured run.
    fn run(&self, uid: WorkerId, seed: Seed) -> HarnessResult<()>;

    /// One worker's share of the false-negative-free correctness check.
    fn check(&self, uid: WorkerId, seed: Seed) -> HarnessResult<()>;
}
