//! Keeping the forbidden load from killing the process.
//!
//! Two strategies share one contract: run the leak primitive once and always
//! come back, with nothing but its cache side effects left behind.
//! `Transactional` wraps it in a TSX region that aborts on the fault;
//! `SignalRecovery` installs a SIGSEGV handler that moves RIP past the
//! faulting sequence.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering::SeqCst};

use libc::{c_int, c_void};
use log::{debug, error};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::{has_rtm, FaultHandling};
use crate::error::{Error, Result};
use crate::leak;

const XBEGIN_STARTED: i32 = !0;

/// Outcome of a single protected run of the leak primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The body ran to the end without faulting.
    Completed,
    /// The forbidden load faulted and the handler resumed past it.
    Recovered,
    /// The transactional region aborted or never started.
    Aborted,
}

pub(crate) enum Strategy {
    Transactional,
    SignalRecovery(SignalHandler),
}

impl Strategy {
    pub fn install(fault_handling: FaultHandling) -> Result<Self> {
        match fault_handling {
            FaultHandling::Transactional => {
                if !has_rtm() {
                    return Err(Error::InvalidConfig(
                        "transactional fault handling needs a CPU with TSX",
                    ));
                }
                Ok(Strategy::Transactional)
            }
            FaultHandling::SignalRecovery => Ok(Strategy::SignalRecovery(SignalHandler::install()?)),
        }
    }

    pub fn fault_handling(&self) -> FaultHandling {
        match self {
            Strategy::Transactional => FaultHandling::Transactional,
            Strategy::SignalRecovery(_) => FaultHandling::SignalRecovery,
        }
    }

    /// # Safety
    /// `probe_base` must be slot 0 of a live probe buffer.
    #[inline(always)]
    pub unsafe fn attempt(&self, target: usize, probe_base: *const u8) -> Attempt {
        match self {
            Strategy::Transactional => {
                if rtm::_xbegin() == XBEGIN_STARTED {
                    leak::leak(target, probe_base);
                    rtm::_xend();
                    Attempt::Completed
                } else {
                    Attempt::Aborted
                }
            }
            Strategy::SignalRecovery(_) => {
                let recovered = RECOVERED.load(SeqCst);
                ARMED.store(true, SeqCst);
                leak::leak(target, probe_base);
                ARMED.store(false, SeqCst);
                if RECOVERED.load(SeqCst) == recovered {
                    Attempt::Completed
                } else {
                    Attempt::Recovered
                }
            }
        }
    }

    pub fn uninstall(self) -> Result<()> {
        match self {
            Strategy::Transactional => Ok(()),
            Strategy::SignalRecovery(handler) => handler.uninstall(),
        }
    }
}

/// Set only while the leak primitive runs under signal recovery.
static ARMED: AtomicBool = AtomicBool::new(false);
static RECOVERED: AtomicUsize = AtomicUsize::new(0);
/// Disposition that was active before ours, for chaining and restoring.
static PREVIOUS: AtomicPtr<SigAction> = AtomicPtr::new(null_mut());

pub(crate) struct SignalHandler {
    _installed: (),
}

impl SignalHandler {
    fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::SigAction(on_segv),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(Signal::SIGSEGV, &action) }.map_err(|e| {
            error!("Failed to setup signal handler");
            Error::Signal(e)
        })?;
        PREVIOUS.store(Box::into_raw(Box::new(previous)), SeqCst);
        debug!("Successfully setup signal handler");
        Ok(SignalHandler { _installed: () })
    }

    fn uninstall(self) -> Result<()> {
        let previous = PREVIOUS.load(SeqCst);
        if previous.is_null() {
            return Ok(());
        }
        unsafe { sigaction(Signal::SIGSEGV, &*previous) }.map_err(Error::Signal)?;
        PREVIOUS.store(null_mut(), SeqCst);
        drop(unsafe { Box::from_raw(previous) });
        debug!("Restored previous signal handler");
        Ok(())
    }
}

extern "C" fn on_segv(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    if ARMED.load(SeqCst) {
        if let Some(ucontext) = unsafe { (context as *mut libc::ucontext_t).as_mut() } {
            let rip = &mut ucontext.uc_mcontext.gregs[libc::REG_RIP as usize];
            if *rip as usize == leak::fault_site() {
                *rip = leak::resume_point() as libc::greg_t;
                RECOVERED.fetch_add(1, SeqCst);
                return;
            }
        }
    }
    unsafe { forward(signal, info, context) }
}

/// Hands a fault that did not come from the leak primitive to whoever owned
/// SIGSEGV before us. With no previous handler the default action is
/// restored, so returning re-executes the faulting instruction and the
/// process dies the usual way.
unsafe fn forward(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    match PREVIOUS.load(SeqCst).as_ref().map(SigAction::handler) {
        Some(SigHandler::SigAction(handler)) => handler(signal, info, context),
        Some(SigHandler::Handler(handler)) => handler(signal),
        _ => {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}

#[cfg(test)]
pub(crate) fn current_segv_handler() -> usize {
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGSEGV, std::ptr::null(), &mut current) };
    current.sa_sigaction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProbeBuffer;
    use crate::tests::engine_lock;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn signal_recovery_skips_faulting_load() {
        let _guard = engine_lock();
        let before = current_segv_handler();
        let buf = ProbeBuffer::new().unwrap();

        let strategy = Strategy::install(FaultHandling::SignalRecovery).unwrap();
        assert_eq!(strategy.fault_handling(), FaultHandling::SignalRecovery);
        assert_eq!(current_segv_handler(), on_segv as usize);

        let readable = Box::new(1u8);
        unsafe {
            assert_eq!(
                strategy.attempt(&*readable as *const u8 as usize, buf.base()),
                Attempt::Completed
            );
            assert_eq!(strategy.attempt(0x10, buf.base()), Attempt::Recovered);
            assert_eq!(strategy.attempt(0x10, buf.base()), Attempt::Recovered);
        }

        strategy.uninstall().unwrap();
        assert_eq!(current_segv_handler(), before);
        assert!(PREVIOUS.load(SeqCst).is_null());
    }

    #[test]
    fn transactional_never_raises_a_signal() {
        if !has_rtm() {
            assert!(matches!(
                Strategy::install(FaultHandling::Transactional),
                Err(Error::InvalidConfig(_))
            ));
            return;
        }
        let _guard = engine_lock();
        let before = current_segv_handler();
        let buf = ProbeBuffer::new().unwrap();
        let strategy = Strategy::install(FaultHandling::Transactional).unwrap();
        assert_eq!(current_segv_handler(), before);

        let outcome = unsafe { strategy.attempt(0x10, buf.base()) };
        assert_eq!(outcome, Attempt::Aborted);
        strategy.uninstall().unwrap();
    }

    extern "C" fn exit_on_segv(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {
        unsafe { libc::_exit(42) }
    }

    /// Runs `before_install` in a forked process, then installs our handler
    /// and faults outside the leak primitive. Returns how the child ended.
    fn fault_in_child(before_install: impl FnOnce()) -> WaitStatus {
        let _guard = engine_lock();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                before_install();
                let strategy = Strategy::install(FaultHandling::SignalRecovery);
                if strategy.is_err() {
                    unsafe { libc::_exit(1) }
                }
                unsafe { (0x10usize as *const u8).read_volatile() };
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => waitpid(child, None).unwrap(),
        }
    }

    #[test]
    fn unrelated_fault_still_kills_the_process() {
        let status = fault_in_child(|| unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        });
        assert!(
            matches!(status, WaitStatus::Signaled(_, Signal::SIGSEGV, _)),
            "{status:?}"
        );
    }

    #[test]
    fn unrelated_fault_reaches_previous_handler() {
        let status = fault_in_child(|| {
            let previous = SigAction::new(
                SigHandler::SigAction(exit_on_segv),
                SaFlags::empty(),
                SigSet::empty(),
            );
            if unsafe { sigaction(Signal::SIGSEGV, &previous) }.is_err() {
                unsafe { libc::_exit(1) }
            }
        });
        assert!(matches!(status, WaitStatus::Exited(_, 42)), "{status:?}");
    }
}
