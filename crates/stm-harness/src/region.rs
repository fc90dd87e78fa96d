// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One shared memory region over a bound artifact
//!
//! [`Region`] owns the `tm_create`/`tm_destroy` lifecycle and exposes thin
//! wrappers over the remaining entry points. Creation and destruction run
//! under a bounded-time guard: an artifact that hangs in either is reported
//! instead of hanging the harness.
//!
//! Soundness note: every operation here feeds addresses into the artifact
//! under evaluation. The harness necessarily trusts the artifact to honor
//! the ABI contract (aligned, in-region transfers; zeroed allocations); no
//! wrapper can defend against an artifact that lies about them.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use stm_abi::{AllocStatus, SharedHandle, TmVtable, TxId, INVALID_SHARED};

use crate::binder::TmLibrary;
use crate::error::{HarnessError, HarnessResult};
use crate::primitives::bounded_run;

/// Maximum waiting time for region creation and destruction.
pub const MAX_SIDE_TIME: Duration = Duration::from_millis(2000);

/// One shared memory region bound to one artifact.
pub struct Region {
    library: Arc<TmLibrary>,
    shared: SharedHandle,
    start: *mut u8,
    size: usize,
    align: usize,
}

// Safety: the region handle and start address are stable for the region's
// lifetime and all mutation of shared memory goes through the artifact's
// transactional entry points, whose whole contract is to mediate concurrent
// access. The harness itself never dereferences `start`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region of `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two dividing `size`.
    pub fn create(library: Arc<TmLibrary>, align: usize, size: usize) -> HarnessResult<Self> {
        debug_assert!(align.is_power_of_two() && size % align == 0);
        let vt = *library.vtable();
        // Pointers cross the channel as integers: the handles are opaque
        // tokens here, not memory this thread may touch.
        let created = bounded_run(
            MAX_SIDE_TIME,
            "The transactional library takes too long creating the shared memory",
            move || {
                let shared = unsafe { (vt.create)(size, align) };
                if shared == INVALID_SHARED {
                    return None;
                }
                let start = unsafe { (vt.start)(shared) };
                Some((shared as usize, start as usize))
            },
        )?;
        let (shared, start) = created.ok_or(HarnessError::RegionCreate)?;
        Ok(Self {
            library,
            shared: shared as SharedHandle,
            start: start as *mut u8,
            size,
            align,
        })
    }

    /// Start address of the first shared segment.
    pub fn start(&self) -> *mut u8 {
        self.start
    }

    /// Size of the first shared segment (in bytes).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Global alignment of the region (in bytes).
    pub fn align(&self) -> usize {
        self.align
    }

    /// The artifact binding this region lives on.
    pub fn library(&self) -> &Arc<TmLibrary> {
        &self.library
    }

    fn vtable(&self) -> &TmVtable {
        self.library.vtable()
    }

    /// Begin a new transaction, `INVALID_TX` on failure.
    pub(crate) fn begin(&self, is_ro: bool) -> TxId {
        unsafe { (self.vtable().begin)(self.shared, is_ro) }
    }

    /// End the given transaction; returns whether it committed.
    pub(crate) fn end(&self, tx: TxId) -> bool {
        unsafe { (self.vtable().end)(self.shared, tx) }
    }

    /// Transactional read: `source` in shared memory, `target` private.
    pub(crate) fn read(&self, tx: TxId, source: *const u8, size: usize, target: *mut u8) -> bool {
        unsafe {
            (self.vtable().read)(
                self.shared,
                tx,
                source as *const c_void,
                size,
                target as *mut c_void,
            )
        }
    }

    /// Transactional write: `source` private, `target` in shared memory.
    pub(crate) fn write(&self, tx: TxId, source: *const u8, size: usize, target: *mut u8) -> bool {
        unsafe {
            (self.vtable().write)(
                self.shared,
                tx,
                source as *const c_void,
                size,
                target as *mut c_void,
            )
        }
    }

    /// Transactional allocation of a fresh shared segment.
    pub(crate) fn alloc(&self, tx: TxId, size: usize, target: &mut *mut u8) -> AllocStatus {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let status = unsafe { (self.vtable().alloc)(self.shared, tx, size, &mut raw) };
        *target = raw as *mut u8;
        status
    }

    /// Transactional release of a segment obtained from [`Self::alloc`].
    pub(crate) fn free(&self, tx: TxId, target: *mut u8) -> bool {
        unsafe { (self.vtable().free)(self.shared, tx, target as *mut c_void) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let vt = *self.vtable();
        let shared = self.shared as usize;
        let destroyed = bounded_run(
            MAX_SIDE_TIME,
            "The transactional library takes too long destroying the shared memory",
            move || unsafe { (vt.destroy)(shared as SharedHandle) },
        );
        if let Err(err) = destroyed {
            // The destroy runner may still be executing inside the artifact;
            // unloading now would pull code out from under it. Terminate with
            // the dedicated "live threads" exit code instead.
            tracing::error!("{err}");
            std::process::exit(2);
        }
    }
}
