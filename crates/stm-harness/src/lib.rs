//! Concurrency grading harness for software transactional memory
//! implementations
//!
//! The harness binds candidate STM artifacts (shared libraries exporting the
//! `tm_*` entry points), drives a contended bank workload over them with
//! tightly synchronized worker threads, and checks the invariants no correct
//! transactional memory may break. Timings of the first artifact (the
//! reference implementation) set the timeout budgets for every candidate
//! after it.
//!
//! # Crate layout
//!
//! - [`binder`]: loads an artifact and resolves its entry points
//! - [`region`], [`tx`], [`cell`]: the transactional client (regions,
//!   scoped transactions with automatic retry, typed shared cells)
//! - [`sync`]: the master/worker phase synchronizer
//! - [`workload`], [`bank`]: the workload interface and the bank workload
//! - [`grading`]: thread lifecycle, repeat loop, timeout escalation
//! - [`clock`], [`primitives`]: monotonic ticks, latch, spin barrier,
//!   bounded-time runner

pub mod bank;
pub mod binder;
pub mod cell;
pub mod clock;
pub mod error;
pub mod grading;
pub mod primitives;
pub mod region;
pub mod sync;
pub mod tx;
pub mod workload;

pub use bank::{Bank, BankConfig};
pub use binder::TmLibrary;
pub use error::{HarnessError, HarnessResult};
pub use grading::{measure, Params, PhaseBudgets, PhaseTimes};
pub use region::Region;
pub use tx::{atomically, Mode, Tx, TxError, TxResult};
pub use workload::{Seed, WorkerId, Workload};
