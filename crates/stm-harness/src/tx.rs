//! Scoped transactions and the retry combinator
//!
//! A [`Tx`] covers exactly one begin/end pair. Every operation returns a
//! [`TxResult`]; an artifact answering `false` marks the transaction aborted
//! and surfaces [`TxError::Retry`], which only [`atomically`] recovers; the
//! workload code just forwards it with `?`. A transaction that is neither
//! aborted nor explicitly committed is ended on drop (this is how an
//! out-of-memory unwind closes its transaction).

use stm_abi::{AllocStatus, TxId, INVALID_TX};

use crate::error::{HarnessError, HarnessResult};
use crate::region::Region;

/// Transaction mode, fixed at begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadWrite,
    ReadOnly,
}

/// Failure of a single transactional operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The artifact aborted the transaction; it can be retried.
    Retry,
    /// Allocation failed without aborting the transaction.
    OutOfMemory,
}

/// Result type alias for transactional operations
pub type TxResult<T> = Result<T, TxError>;

/// One pending transaction on a [`Region`].
pub struct Tx<'r> {
    region: &'r Region,
    id: TxId,
    aborted: bool,
    committed: bool,
    is_ro: bool,
}

impl<'r> Tx<'r> {
    /// Begin a transaction. An invalid handle from the artifact is fatal for
    /// the whole evaluation, not a retry.
    pub fn begin(region: &'r Region, mode: Mode) -> HarnessResult<Self> {
        let is_ro = matches!(mode, Mode::ReadOnly);
        let id = region.begin(is_ro);
        if id == INVALID_TX {
            return Err(HarnessError::TxBegin);
        }
        Ok(Self {
            region,
            id,
            aborted: false,
            committed: false,
            is_ro,
        })
    }

    /// The region this transaction runs on.
    pub fn region(&self) -> &'r Region {
        self.region
    }

    /// Read `size` bytes from shared `source` into private `target`.
    pub fn read(&mut self, source: *const u8, size: usize, target: *mut u8) -> TxResult<()> {
        if !self.region.read(self.id, source, size, target) {
            self.aborted = true;
            return Err(TxError::Retry);
        }
        Ok(())
    }

    /// Write `size` bytes from private `source` into shared `target`.
    pub fn write(&mut self, source: *const u8, size: usize, target: *mut u8) -> TxResult<()> {
        debug_assert!(!self.is_ro, "write inside a read-only transaction");
        if !self.region.write(self.id, source, size, target) {
            self.aborted = true;
            return Err(TxError::Retry);
        }
        Ok(())
    }

    /// Allocate a fresh shared segment of `size` bytes.
    pub fn alloc(&mut self, size: usize) -> TxResult<*mut u8> {
        debug_assert!(!self.is_ro, "alloc inside a read-only transaction");
        let mut target: *mut u8 = std::ptr::null_mut();
        match self.region.alloc(self.id, size, &mut target) {
            AllocStatus::Success => Ok(target),
            AllocStatus::NoMem => Err(TxError::OutOfMemory),
            AllocStatus::Abort => {
                self.aborted = true;
                Err(TxError::Retry)
            }
        }
    }

    /// Free a shared segment previously allocated in this region.
    pub fn free(&mut self, target: *mut u8) -> TxResult<()> {
        debug_assert!(!self.is_ro, "free inside a read-only transaction");
        if !self.region.free(self.id, target) {
            self.aborted = true;
            return Err(TxError::Retry);
        }
        Ok(())
    }

    /// Commit: returns whether the whole transaction succeeded.
    pub fn commit(mut self) -> bool {
        self.committed = true;
        self.region.end(self.id)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // An aborted transaction is already closed on the artifact side; a
        // committed one was closed by `commit`. Anything else (early exits
        // that skipped both) still owes the artifact an end call.
        if !self.aborted && !self.committed {
            let _ = self.region.end(self.id);
        }
    }
}

/// Repeat a transaction body until it commits.
///
/// The body runs inside a fresh transaction each attempt. `Retry` (from the
/// body or from a failed commit) restarts it; out-of-memory escapes as a
/// harness error; the body's value is returned once a commit sticks. There
/// is no bound on the number of retries.
pub fn atomically<'r, T, F>(region: &'r Region, mode: Mode, mut body: F) -> HarnessResult<T>
where
    F: FnMut(&mut Tx<'r>) -> TxResult<T>,
{
    loop {
        let mut tx = Tx::begin(region, mode)?;
        match body(&mut tx) {
            Ok(value) => {
                if tx.commit() {
                    return Ok(value);
                }
            }
            Err(TxError::Retry) => {}
            Err(TxError::OutOfMemory) => return Err(HarnessError::OutOfMemory),
        }
    }
}
