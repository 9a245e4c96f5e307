//! Flush+Reload channel and the page-spaced probe buffer it reads.

use std::alloc::{alloc, dealloc, Layout};
use std::arch::asm;

use crate::error::{Error, Result};
use crate::timing::duration_of;

pub const PAGE_SIZE: usize = 4096;
/// One slot per possible byte value.
pub const SLOTS: usize = 256;

/// Pages left untouched on either side of the slots. Nothing else on the heap
/// shares a page (or an adjacent page) with slot 0 or slot 255, so the only
/// way a slot gets cached is through an access to that slot.
const GUARD_PAGES: usize = 2;
const FILL_PATTERN: u8 = 0xab;

#[inline(always)]
pub unsafe fn flush(adrs: *const u8) {
    asm!(
        "mfence",
        "clflush [{0}]",
        in(reg) adrs,
    );
}

#[inline(always)]
pub unsafe fn maccess(adrs: *const u8) {
    adrs.read_volatile();
}

/// Cycles needed to load `adrs`, leaving its cache state untouched.
#[inline(always)]
pub unsafe fn reload_time(adrs: *const u8) -> u64 {
    duration_of(
        #[inline(always)]
        || maccess(adrs),
    )
}

/// Times one access to `adrs`, evicts it, and reports a hit if the access
/// was faster than `threshold`. The line is always flushed, so consecutive
/// probes of the same address are independent.
#[inline(always)]
pub unsafe fn probe(adrs: *const u8, threshold: u64) -> bool {
    let elapsed = reload_time(adrs);
    flush(adrs);
    elapsed < threshold
}

/// 256 page-spaced slots carved out of a larger page-aligned allocation.
///
/// Every slot sits at the start of its own page and the pages are backed by
/// distinct physical frames (they are written once at allocation, so none of
/// them stays on the shared zero page). That keeps each slot independently
/// flushable and stops the adjacent-line prefetcher from pulling in a
/// neighbour.
pub struct ProbeBuffer {
    raw: *mut u8,
    layout: Layout,
}

impl ProbeBuffer {
    pub fn new() -> Result<Self> {
        let layout = Layout::from_size_align((SLOTS + 2 * GUARD_PAGES) * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| Error::ProbeAllocation)?;
        let raw = unsafe { alloc(layout) };
        if raw.is_null() {
            return Err(Error::ProbeAllocation);
        }
        unsafe { raw.write_bytes(FILL_PATTERN, layout.size()) };

        let buf = ProbeBuffer { raw, layout };
        buf.flush_all();
        Ok(buf)
    }

    /// Start of slot 0.
    #[inline(always)]
    pub fn base(&self) -> *const u8 {
        unsafe { self.raw.add(GUARD_PAGES * PAGE_SIZE) }
    }

    #[inline(always)]
    pub fn slot(&self, value: usize) -> *const u8 {
        debug_assert!(value < SLOTS);
        unsafe { self.base().add(value * PAGE_SIZE) }
    }

    pub fn flush_all(&self) {
        for i in 0..SLOTS {
            unsafe { flush(self.slot(i)) }
        }
    }

    #[inline(always)]
    pub fn probe(&self, value: usize, threshold: u64) -> bool {
        unsafe { probe(self.slot(value), threshold) }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.raw, self.layout.size()).to_vec() }
    }
}

impl Drop for ProbeBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.raw, self.layout) }
    }
}
