//! Monotonic time accounting
//!
//! Phase timings cross thread boundaries as plain nanosecond counts, so the
//! clock surface is a raw `u64` tick (1 tick = 1 ns) read from
//! `CLOCK_MONOTONIC` rather than an opaque `Instant`. A sentinel marks a
//! failed clock read; it is nonzero so a zero-length measurement stays
//! distinguishable from a broken one.

use std::mem::MaybeUninit;

/// Nanosecond tick count.
pub type Tick = u64;

/// Sentinel for a failed clock read.
pub const INVALID_TICK: Tick = 0xbadc0de;

fn convert(func: unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> i32) -> Tick {
    let mut buf = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { func(libc::CLOCK_MONOTONIC, buf.as_mut_ptr()) } < 0 {
        return INVALID_TICK;
    }
    let buf = unsafe { buf.assume_init() };
    let res = buf.tv_nsec as Tick + buf.tv_sec as Tick * 1_000_000_000;
    if res == INVALID_TICK {
        // Bad luck: a real timestamp collided with the sentinel.
        return INVALID_TICK + 1;
    }
    res
}

/// Read the monotonic clock.
pub fn now() -> Tick {
    convert(libc::clock_gettime)
}

/// Resolution of the monotonic clock (in ns), `INVALID_TICK` if unknown.
pub fn resolution() -> Tick {
    convert(libc::clock_getres)
}

/// Accumulating stopwatch over [`now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Chrono {
    total: Tick,
    local: Tick,
}

impl Chrono {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring a time segment.
    pub fn start(&mut self) {
        self.local = now();
    }

    /// Elapsed ticks since the last [`start`](Self::start).
    pub fn delta(&self) -> Tick {
        now().wrapping_sub(self.local)
    }

    /// Stop measuring the current segment and add it to the total.
    pub fn stop(&mut self) {
        self.total = self.total.wrapping_add(self.delta());
    }

    /// Reset the accumulated total.
    pub fn reset(&mut self) {
        self.total = 0;
    }

    /// Accumulated total (in ns).
    pub fn total(&self) -> Tick {
        self.total
    }
}
