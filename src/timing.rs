//! Cycle counter reads fenced against out-of-order execution.

use x86::fence::mfence;

/// Reads the time stamp counter with a full memory fence on each side, so
/// neither earlier nor later loads can drift into the measured window.
#[inline(always)]
pub fn timestamp() -> u64 {
    unsafe {
        mfence();
        let (tsc, _aux) = x86::time::rdtscp();
        mfence();
        tsc
    }
}

/// Elapsed cycles spent in `f`.
#[inline(always)]
pub fn duration_of<F: FnOnce()>(f: F) -> u64 {
    let start = timestamp();
    f();
    timestamp().saturating_sub(start)
}
