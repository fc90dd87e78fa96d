// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Baseline lock-based software transactional memory.
//!
//! This is the reference the harness grades candidates against: a minimal
//! implementation that is correct by construction rather than fast. One
//! reader–writer lock per region serializes every read-write transaction
//! against all others, so `tm_read`/`tm_write` degenerate to plain byte
//! copies and never force an abort.
//!
//! Dynamically allocated segments are prepended with a doubly-linked node so
//! that `tm_destroy` can release whatever the workload leaked. The first
//! segment is never on that list.
//!
//! The crate builds both as a `cdylib` (the loadable artifact handed to the
//! harness CLI) and as an `rlib` (bound in-process by the harness's tests).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::c_void;
use std::mem;
use std::ptr;

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use stm_abi::{AllocStatus, SharedHandle, TxId, INVALID_SHARED};

// Sentinel transaction ids: the lock mode to release at `tm_end` is encoded
// in the id itself. Distinct from `INVALID_TX`.
const READ_ONLY_TX: TxId = usize::MAX - 10;
const READ_WRITE_TX: TxId = usize::MAX - 11;

/// Node prepended to every dynamically allocated segment.
///
/// `total_size` is the full allocation size (node header included), needed
/// to rebuild the layout at deallocation time.
#[repr(C)]
struct SegmentNode {
    prev: *mut SegmentNode,
    next: *mut SegmentNode,
    total_size: usize,
}

/// Reset a list head to the empty (self-linked) state.
unsafe fn node_reset(node: *mut SegmentNode) {
    (*node).prev = node;
    (*node).next = node;
}

/// Insert `node` before `base`.
unsafe fn node_insert(node: *mut SegmentNode, base: *mut SegmentNode) {
    let prev = (*base).prev;
    (*node).prev = prev;
    (*node).next = base;
    (*base).prev = node;
    (*prev).next = node;
}

/// Unlink `node` from its list.
unsafe fn node_remove(node: *mut SegmentNode) {
    let prev = (*node).prev;
    let next = (*node).next;
    (*prev).next = next;
    (*next).prev = prev;
}

// Region state is only ever touched through raw places: forming a Rust
// reference to the whole struct would assert immutability that concurrent
// `tm_alloc`/`tm_free` calls (which edit the segment list under the
// exclusive lock) do not uphold. The `lock` field is the one exception: it
// is internally atomic and safe to share.
#[repr(C)]
struct Region {
    /// Per-region lock: shared for read-only transactions, exclusive for
    /// read-write ones.
    lock: RawRwLock,
    /// First (non-deallocatable) segment.
    start: *mut u8,
    /// Head of the dynamic segment list.
    allocs: SegmentNode,
    /// First segment size (in bytes).
    size: usize,
    /// Claimed region alignment (in bytes).
    align: usize,
    /// Actual allocation alignment: at least pointer-sized so the segment
    /// node is itself aligned.
    align_alloc: usize,
    /// Node header space, rounded up to `align_alloc` so the address handed
    /// to the caller keeps the region alignment.
    delta_alloc: usize,
}

unsafe fn region_lock<'a>(shared: SharedHandle) -> &'a RawRwLock {
    &*ptr::addr_of!((*(shared as *mut Region)).lock)
}

/// Create a shared memory region.
///
/// # Safety
///
/// `align` must be a power of two; the returned handle must only be passed
/// to the other `tm_*` entry points of this library.
#[no_mangle]
pub unsafe extern "C" fn tm_create(size: usize, align: usize) -> SharedHandle {
    let align_alloc = align.max(mem::size_of::<*mut c_void>());
    let layout = match Layout::from_size_align(size, align_alloc) {
        Ok(layout) => layout,
        Err(_) => return INVALID_SHARED,
    };
    let start = alloc_zeroed(layout);
    if start.is_null() {
        return INVALID_SHARED;
    }
    let delta_alloc = (mem::size_of::<SegmentNode>() + align_alloc - 1) / align_alloc * align_alloc;
    let region = Box::into_raw(Box::new(Region {
        lock: <RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
        start,
        allocs: SegmentNode {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            total_size: 0,
        },
        size,
        align,
        align_alloc,
        delta_alloc,
    }));
    // The list head links to itself, so it can only be wired up once the
    // region has its final address.
    node_reset(ptr::addr_of_mut!((*region).allocs));
    region as SharedHandle
}

/// Destroy a region, releasing the first segment and every dynamic segment
/// the workload did not free.
///
/// # Safety
///
/// No transaction may be outstanding on the region.
#[no_mangle]
pub unsafe extern "C" fn tm_destroy(shared: SharedHandle) {
    let region = shared as *mut Region;
    let head = ptr::addr_of_mut!((*region).allocs);
    let align_alloc = (*region).align_alloc;
    loop {
        let node = (*head).next;
        if node == head {
            break;
        }
        node_remove(node);
        let layout = Layout::from_size_align_unchecked((*node).total_size, align_alloc);
        dealloc(node as *mut u8, layout);
    }
    let first_layout = Layout::from_size_align_unchecked((*region).size, align_alloc);
    dealloc((*region).start, first_layout);
    drop(Box::from_raw(region));
}

/// # Safety
///
/// `shared` must be a live handle returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_start(shared: SharedHandle) -> *mut c_void {
    (*(shared as *mut Region)).start as *mut c_void
}

/// # Safety
///
/// `shared` must be a live handle returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_size(shared: SharedHandle) -> usize {
    (*(shared as *mut Region)).size
}

/// # Safety
///
/// `shared` must be a live handle returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_align(shared: SharedHandle) -> usize {
    (*(shared as *mut Region)).align
}

/// Begin a transaction: shared lock for read-only, exclusive otherwise.
///
/// # Safety
///
/// `shared` must be a live handle returned by [`tm_create`]; the returned
/// id must be closed with [`tm_end`] on the same thread.
#[no_mangle]
pub unsafe extern "C" fn tm_begin(shared: SharedHandle, is_ro: bool) -> TxId {
    let lock = region_lock(shared);
    if is_ro {
        lock.lock_shared();
        READ_ONLY_TX
    } else {
        lock.lock_exclusive();
        READ_WRITE_TX
    }
}

/// End a transaction. Under the big lock a transaction always commits.
///
/// # Safety
///
/// `tx` must have been returned by [`tm_begin`] on this region and not yet
/// ended.
#[no_mangle]
pub unsafe extern "C" fn tm_end(shared: SharedHandle, tx: TxId) -> bool {
    let lock = region_lock(shared);
    if tx == READ_ONLY_TX {
        lock.unlock_shared();
    } else {
        lock.unlock_exclusive();
    }
    true
}

/// # Safety
///
/// `source` must point to `size` readable bytes in the region, `target` to
/// `size` writable private bytes, and the calling transaction must hold the
/// region lock (i.e. be between `tm_begin` and `tm_end`).
#[no_mangle]
pub unsafe extern "C" fn tm_read(
    _shared: SharedHandle,
    _tx: TxId,
    source: *const c_void,
    size: usize,
    target: *mut c_void,
) -> bool {
    ptr::copy_nonoverlapping(source as *const u8, target as *mut u8, size);
    true
}

/// # Safety
///
/// `source` must point to `size` readable private bytes, `target` to `size`
/// writable bytes in the region, and the calling transaction must hold the
/// region lock exclusively.
#[no_mangle]
pub unsafe extern "C" fn tm_write(
    _shared: SharedHandle,
    _tx: TxId,
    source: *const c_void,
    size: usize,
    target: *mut c_void,
) -> bool {
    ptr::copy_nonoverlapping(source as *const u8, target as *mut u8, size);
    true
}

/// Allocate a dynamic segment: node header, then the zeroed user block.
///
/// # Safety
///
/// Must be called from within a read-write transaction on `shared`; the
/// exclusive lock is what protects the segment list.
#[no_mangle]
pub unsafe extern "C" fn tm_alloc(
    shared: SharedHandle,
    _tx: TxId,
    size: usize,
    target: *mut *mut c_void,
) -> AllocStatus {
    let region = shared as *mut Region;
    let align_alloc = (*region).align_alloc;
    let delta_alloc = (*region).delta_alloc;
    let total_size = delta_alloc + size;
    let layout = match Layout::from_size_align(total_size, align_alloc) {
        Ok(layout) => layout,
        Err(_) => return AllocStatus::NoMem,
    };
    let block = alloc_zeroed(layout);
    if block.is_null() {
        return AllocStatus::NoMem;
    }
    let node = block as *mut SegmentNode;
    (*node).total_size = total_size;
    node_insert(node, ptr::addr_of_mut!((*region).allocs));
    *target = block.add(delta_alloc) as *mut c_void;
    AllocStatus::Success
}

/// Free a dynamic segment previously returned by [`tm_alloc`].
///
/// # Safety
///
/// Same locking requirement as [`tm_alloc`]; `target` must be an address
/// obtained from `tm_alloc` on this region and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn tm_free(shared: SharedHandle, _tx: TxId, target: *mut c_void) -> bool {
    let region = shared as *mut Region;
    let align_alloc = (*region).align_alloc;
    let node = (target as *mut u8).sub((*region).delta_alloc) as *mut SegmentNode;
    node_remove(node);
    let layout = Layout::from_size_align_unchecked((*node).total_size, align_alloc);
    dealloc(node as *mut u8, layout);
    true
}

#[cfg(test)]
mod tests {
    use std::thread;

    use stm_abi::INVALID_TX;

    use super::*;

    const WORD: usize = mem::size_of::<usize>();

    unsafe fn read_word(shared: SharedHandle, tx: TxId, addr: *const c_void) -> usize {
        let mut out = 0usize;
        assert!(tm_read(
            shared,
            tx,
            addr,
            WORD,
            &mut out as *mut usize as *mut c_void
        ));
        out
    }

    unsafe fn write_word(shared: SharedHandle, tx: TxId, addr: *mut c_void, value: usize) {
        assert!(tm_write(
            shared,
            tx,
            &value as *const usize as *const c_void,
            WORD,
            addr
        ));
    }

    #[test]
    fn test_create_invalid_alignment() {
        let shared = unsafe { tm_create(96, 24) };
        assert_eq!(shared, INVALID_SHARED);
    }

    #[test]
    fn test_region_accessors_are_stable() {
        unsafe {
            let shared = tm_create(64, 8);
            assert_ne!(shared, INVALID_SHARED);
            let start = tm_start(shared);
            assert!(!start.is_null());
            assert_eq!(start as usize % 8, 0);
            for _ in 0..3 {
                assert_eq!(tm_start(shared), start);
                assert_eq!(tm_size(shared), 64);
                assert_eq!(tm_align(shared), 8);
            }
            tm_destroy(shared);
        }
    }

    #[test]
    fn test_first_segment_zeroed() {
        unsafe {
            let shared = tm_create(8 * WORD, WORD);
            let tx = tm_begin(shared, true);
            assert_ne!(tx, INVALID_TX);
            let start = tm_start(shared) as *const u8;
            for i in 0..8 {
                let addr = start.add(i * WORD) as *const c_void;
                assert_eq!(read_word(shared, tx, addr), 0);
            }
            assert!(tm_end(shared, tx));
            tm_destroy(shared);
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        unsafe {
            let shared = tm_create(4 * WORD, WORD);
            let start = tm_start(shared);

            let tx = tm_begin(shared, false);
            write_word(shared, tx, start, 0xdead);
            assert_eq!(read_word(shared, tx, start), 0xdead);
            assert!(tm_end(shared, tx));

            // Visible to a later read-only transaction.
            let tx = tm_begin(shared, true);
            assert_eq!(read_word(shared, tx, start), 0xdead);
            assert!(tm_end(shared, tx));

            tm_destroy(shared);
        }
    }

    #[test]
    fn test_alloc_returns_aligned_zeroed_segment() {
        unsafe {
            let shared = tm_create(4 * WORD, WORD);
            let tx = tm_begin(shared, false);
            let mut segment: *mut c_void = ptr::null_mut();
            assert_eq!(
                tm_alloc(shared, tx, 4 * WORD, &mut segment),
                AllocStatus::Success
            );
            assert!(!segment.is_null());
            assert_eq!(segment as usize % WORD, 0);
            for i in 0..4 {
                let addr = (segment as *const u8).add(i * WORD) as *const c_void;
                assert_eq!(read_word(shared, tx, addr), 0);
            }
            assert!(tm_free(shared, tx, segment));
            assert!(tm_end(shared, tx));
            tm_destroy(shared);
        }
    }

    #[test]
    fn test_destroy_releases_leaked_segments() {
        unsafe {
            let shared = tm_create(4 * WORD, WORD);
            let tx = tm_begin(shared, false);
            for _ in 0..3 {
                let mut segment: *mut c_void = ptr::null_mut();
                assert_eq!(
                    tm_alloc(shared, tx, 2 * WORD, &mut segment),
                    AllocStatus::Success
                );
            }
            assert!(tm_end(shared, tx));
            // The three segments were never freed; destroy reclaims them.
            tm_destroy(shared);
        }
    }

    #[test]
    fn test_begin_modes_use_distinct_ids() {
        unsafe {
            let shared = tm_create(WORD, WORD);
            let ro = tm_begin(shared, true);
            assert!(tm_end(shared, ro));
            let rw = tm_begin(shared, false);
            assert!(tm_end(shared, rw));
            assert_ne!(ro, rw);
            assert_ne!(ro, INVALID_TX);
            assert_ne!(rw, INVALID_TX);
            tm_destroy(shared);
        }
    }

    #[test]
    fn test_concurrent_increments_serialize() {
        const THREADS: usize = 4;
        const INCREMENTS: usize = 1000;

        let shared = unsafe { tm_create(WORD, WORD) };
        let shared_bits = shared as usize;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                thread::spawn(move || unsafe {
                    let shared = shared_bits as SharedHandle;
                    let start = tm_start(shared);
                    for _ in 0..INCREMENTS {
                        let tx = tm_begin(shared, false);
                        let value = read_word(shared, tx, start);
                        write_word(shared, tx, start, value + 1);
                        assert!(tm_end(shared, tx));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        unsafe {
            let tx = tm_begin(shared, true);
            assert_eq!(read_word(shared, tx, tm_start(shared)), THREADS * INCREMENTS);
            assert!(tm_end(shared, tx));
            tm_destroy(shared);
        }
    }
}
